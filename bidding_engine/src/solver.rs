use crate::error::{ConstraintGroup, ConstraintViolation, EngineError, ErrorContext};
use crate::models::{SolverKind, SolverSettings};
use good_lp::variable::UnsolvedProblem;
use good_lp::{
    constraint, variable, Constraint, Expression, ProblemVariables, ResolutionError, Solution,
    SolverModel, Variable,
};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Index of a variable inside a `LinearProgram`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Maximise,
    Minimise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Le,
    Ge,
    Eq,
}

/// Variable bounds that belong to a constraint family and are dropped with it
#[derive(Debug, Clone, Copy)]
pub struct Band {
    pub group: ConstraintGroup,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone)]
pub struct VarDef {
    pub name: String,
    pub lower: f64,
    pub upper: Option<f64>,
    pub binary: bool,
    pub band: Option<Band>,
}

impl VarDef {
    /// Structural bounds intersected with the band, if any
    pub fn bounds(&self) -> (f64, Option<f64>) {
        match self.band {
            Some(band) => (
                self.lower.max(band.lower),
                Some(self.upper.map_or(band.upper, |u| u.min(band.upper))),
            ),
            None => (self.lower, self.upper),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Row {
    pub terms: Vec<(VarId, f64)>,
    pub sense: Sense,
    pub rhs: f64,
    pub group: ConstraintGroup,
}

/// Solver-independent model description
#[derive(Debug, Clone)]
pub struct LinearProgram {
    pub direction: Direction,
    pub vars: Vec<VarDef>,
    pub rows: Vec<Row>,
    pub objective: Vec<(VarId, f64)>,
    pub objective_constant: f64,
}

impl LinearProgram {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            vars: Vec::new(),
            rows: Vec::new(),
            objective: Vec::new(),
            objective_constant: 0.0,
        }
    }

    pub fn add_var(&mut self, name: impl Into<String>, lower: f64, upper: Option<f64>) -> VarId {
        self.vars.push(VarDef {
            name: name.into(),
            lower,
            upper,
            binary: false,
            band: None,
        });
        VarId(self.vars.len() - 1)
    }

    pub fn add_binary(&mut self, name: impl Into<String>) -> VarId {
        self.vars.push(VarDef {
            name: name.into(),
            lower: 0.0,
            upper: Some(1.0),
            binary: true,
            band: None,
        });
        VarId(self.vars.len() - 1)
    }

    /// Tighten `var` to `[lower, upper]` as part of `group`
    pub fn set_band(&mut self, var: VarId, group: ConstraintGroup, lower: f64, upper: f64) {
        self.vars[var.0].band = Some(Band { group, lower, upper });
    }

    pub fn add_row(&mut self, group: ConstraintGroup, terms: Vec<(VarId, f64)>, sense: Sense, rhs: f64) {
        self.rows.push(Row {
            terms,
            sense,
            rhs,
            group,
        });
    }

    pub fn add_objective_term(&mut self, var: VarId, coefficient: f64) {
        if coefficient != 0.0 {
            self.objective.push((var, coefficient));
        }
    }

    pub fn has_integers(&self) -> bool {
        self.vars.iter().any(|v| v.binary)
    }

    pub fn rows_in(&self, group: ConstraintGroup) -> usize {
        self.rows.iter().filter(|r| r.group == group).count()
    }

    /// Whether any row or variable band belongs to `group`
    pub fn constrains(&self, group: ConstraintGroup) -> bool {
        self.rows_in(group) > 0 || self.vars.iter().any(|v| v.band.map(|b| b.group) == Some(group))
    }

    /// Copy of the program with every row and variable band of `group` removed
    pub fn without_group(&self, group: ConstraintGroup) -> Self {
        let vars = self
            .vars
            .iter()
            .cloned()
            .map(|mut v| {
                if v.band.map(|b| b.group) == Some(group) {
                    v.band = None;
                }
                v
            })
            .collect();
        Self {
            direction: self.direction,
            vars,
            rows: self.rows.iter().filter(|r| r.group != group).cloned().collect(),
            objective: self.objective.clone(),
            objective_constant: self.objective_constant,
        }
    }

    pub fn evaluate_objective(&self, values: &[f64]) -> f64 {
        self.objective_constant
            + self
                .objective
                .iter()
                .map(|&(VarId(i), c)| c * values[i])
                .sum::<f64>()
    }
}

#[derive(Debug, Clone)]
pub struct LpSolution {
    values: Vec<f64>,
    pub objective: f64,
    /// Backend that produced the solution
    pub solver: &'static str,
}

impl LpSolution {
    pub fn value(&self, var: VarId) -> f64 {
        self.values[var.0]
    }

    pub fn values(&self, vars: &[VarId]) -> Vec<f64> {
        vars.iter().map(|&v| self.value(v)).collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolveError {
    #[error("model is infeasible")]
    Infeasible,
    #[error("model is unbounded")]
    Unbounded,
    #[error("time budget of {0:?} exhausted")]
    Timeout(Duration),
    #[error("numerical failure: {0}")]
    Numerical(String),
    #[error("{0}")]
    Unsupported(&'static str),
}

impl SolveError {
    fn is_retryable(&self) -> bool {
        matches!(self, SolveError::Timeout(_) | SolveError::Numerical(_))
    }
}

impl From<ResolutionError> for SolveError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::Infeasible => SolveError::Infeasible,
            ResolutionError::Unbounded => SolveError::Unbounded,
            other => SolveError::Numerical(other.to_string()),
        }
    }
}

/// Terminal failure of a budgeted solve
#[derive(Debug, Clone)]
pub struct BudgetedFailure {
    pub error: SolveError,
    pub attempts: u32,
}

impl BudgetedFailure {
    /// Map to the engine error of the stage that ran the solve; infeasibility carries
    /// the violations found by the caller's diagnosis
    pub fn into_engine_error(
        self,
        context: ErrorContext,
        violations: Vec<ConstraintViolation>,
    ) -> EngineError {
        match self.error {
            SolveError::Infeasible => EngineError::Infeasible {
                context,
                violations,
            },
            other => EngineError::SolverFailure {
                context,
                attempts: self.attempts,
                reason: other.to_string(),
            },
        }
    }
}

/// Narrow capability over an external LP/MILP solver
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports_integers(&self) -> bool;
    fn solve(&self, program: &LinearProgram) -> Result<LpSolution, SolveError>;
}

/// Pure-Rust simplex with branch and bound
pub struct MicroLpBackend;

/// Interior point, continuous models only
pub struct ClarabelBackend;

impl SolverBackend for MicroLpBackend {
    fn name(&self) -> &'static str {
        "microlp"
    }

    fn supports_integers(&self) -> bool {
        true
    }

    fn solve(&self, program: &LinearProgram) -> Result<LpSolution, SolveError> {
        let (unsolved, translated) = Translated::build(program);
        translated.finish(unsolved.using(good_lp::microlp), program, self.name())
    }
}

impl SolverBackend for ClarabelBackend {
    fn name(&self) -> &'static str {
        "clarabel"
    }

    fn supports_integers(&self) -> bool {
        false
    }

    fn solve(&self, program: &LinearProgram) -> Result<LpSolution, SolveError> {
        if program.has_integers() {
            return Err(SolveError::Unsupported("clarabel cannot solve models with binaries"));
        }
        let (unsolved, translated) = Translated::build(program);
        translated.finish(unsolved.using(good_lp::clarabel), program, self.name())
    }
}

pub fn backend_for(kind: SolverKind) -> Arc<dyn SolverBackend> {
    match kind {
        SolverKind::MicroLp => Arc::new(MicroLpBackend),
        SolverKind::Clarabel => Arc::new(ClarabelBackend),
    }
}

/// The configured backend if it handles binaries, otherwise microlp
pub fn integer_backend(backend: &Arc<dyn SolverBackend>) -> Arc<dyn SolverBackend> {
    if backend.supports_integers() {
        Arc::clone(backend)
    } else {
        Arc::new(MicroLpBackend)
    }
}

struct Translated {
    vars: Vec<Variable>,
    constraints: Vec<Constraint>,
}

impl Translated {
    fn build(program: &LinearProgram) -> (UnsolvedProblem, Self) {
        let mut problem = ProblemVariables::new();
        let vars: Vec<Variable> = program
            .vars
            .iter()
            .map(|def| {
                let mut v = variable().name(def.name.clone());
                if def.binary {
                    v = v.binary();
                } else {
                    let (lower, upper) = def.bounds();
                    v = v.min(lower);
                    if let Some(upper) = upper {
                        v = v.max(upper);
                    }
                }
                problem.add(v)
            })
            .collect();

        let objective: Expression = program
            .objective
            .iter()
            .map(|&(VarId(i), c)| c * vars[i])
            .sum();

        let constraints = program
            .rows
            .iter()
            .filter(|row| !row.terms.is_empty())
            .map(|row| {
                let lhs: Expression = row.terms.iter().map(|&(VarId(i), c)| c * vars[i]).sum();
                let rhs = row.rhs;
                match row.sense {
                    Sense::Le => constraint!(lhs <= rhs),
                    Sense::Ge => constraint!(lhs >= rhs),
                    Sense::Eq => constraint!(lhs == rhs),
                }
            })
            .collect();

        let unsolved = match program.direction {
            Direction::Maximise => problem.maximise(objective),
            Direction::Minimise => problem.minimise(objective),
        };
        (unsolved, Self { vars, constraints })
    }

    fn finish<M>(self, model: M, program: &LinearProgram, solver: &'static str) -> Result<LpSolution, SolveError>
    where
        M: SolverModel<Error = ResolutionError>,
    {
        let model = self.constraints.into_iter().fold(model, |m, c| m.with(c));
        let solution = model.solve()?;
        let values: Vec<f64> = self.vars.iter().map(|&v| solution.value(v)).collect();
        let objective = program.evaluate_objective(&values);
        Ok(LpSolution {
            values,
            objective,
            solver,
        })
    }
}

/// Run a blocking solve under a wall-clock budget, retrying once with a larger budget
/// after a timeout or numerical failure.
///
/// The budget is enforced by a private current-thread runtime, so this must be called
/// from synchronous code. Called from inside a tokio runtime it fails with
/// `SolveError::Unsupported` instead of blocking that runtime; wrap the call in
/// `spawn_blocking` there. A timed-out solve cannot be cancelled and finishes on its
/// own thread.
pub fn solve_with_budget(
    backend: &Arc<dyn SolverBackend>,
    program: &LinearProgram,
    settings: &SolverSettings,
) -> Result<LpSolution, BudgetedFailure> {
    let budgets = [
        settings.time_limit_secs,
        settings.time_limit_secs * settings.retry_budget_factor,
    ];

    let mut last_error = SolveError::Numerical("solver was never invoked".to_string());
    for (attempt, secs) in budgets.iter().enumerate() {
        let attempts = attempt as u32 + 1;
        let budget = match Duration::try_from_secs_f64(*secs) {
            Ok(budget) => budget,
            Err(_) => {
                return Err(BudgetedFailure {
                    error: SolveError::Unsupported("solver time budget is not a representable duration"),
                    attempts,
                })
            }
        };
        debug!(
            "{}: solving {} vars / {} rows (attempt {}, budget {:?})",
            backend.name(),
            program.vars.len(),
            program.rows.len(),
            attempts,
            budget
        );

        match run_with_timeout(Arc::clone(backend), program.clone(), budget) {
            Ok(mut solution) => {
                solution.solver = backend.name();
                for value in solution.values.iter_mut() {
                    if value.abs() < settings.zero_tolerance {
                        *value = 0.0;
                    }
                }
                solution.objective = program.evaluate_objective(&solution.values);
                return Ok(solution);
            }
            Err(err) if err.is_retryable() && attempt == 0 => {
                warn!("{} attempt {} failed ({}); retrying with relaxed budget", backend.name(), attempts, err);
                last_error = err;
            }
            Err(err) => {
                return Err(BudgetedFailure {
                    error: err,
                    attempts,
                })
            }
        }
    }

    Err(BudgetedFailure {
        error: last_error,
        attempts: budgets.len() as u32,
    })
}

fn run_with_timeout(
    backend: Arc<dyn SolverBackend>,
    program: LinearProgram,
    budget: Duration,
) -> Result<LpSolution, SolveError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(SolveError::Unsupported(
            "budgeted solves must run outside an async runtime",
        ));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| SolveError::Numerical(format!("failed to start solver runtime: {}", e)))?;

    let outcome = runtime.block_on(async move {
        let handle = tokio::task::spawn_blocking(move || backend.solve(&program));
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SolveError::Numerical(format!("solver task aborted: {}", join_error))),
            Err(_) => Err(SolveError::Timeout(budget)),
        }
    });

    // A timed-out solve keeps running on its blocking thread; do not wait for it
    runtime.shutdown_background();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_program() -> (LinearProgram, VarId, VarId) {
        // max 3x + 2y  s.t.  x + y <= 4,  x <= 3
        let mut lp = LinearProgram::new(Direction::Maximise);
        let x = lp.add_var("x", 0.0, None);
        let y = lp.add_var("y", 0.0, None);
        lp.add_objective_term(x, 3.0);
        lp.add_objective_term(y, 2.0);
        lp.add_row(ConstraintGroup::PowerLimit, vec![(x, 1.0), (y, 1.0)], Sense::Le, 4.0);
        lp.add_row(ConstraintGroup::Ramp, vec![(x, 1.0)], Sense::Le, 3.0);
        (lp, x, y)
    }

    #[test]
    fn test_microlp_solves_small_lp() {
        let (lp, x, y) = small_program();
        let solution = MicroLpBackend.solve(&lp).unwrap();
        assert!((solution.value(x) - 3.0).abs() < 1e-6);
        assert!((solution.value(y) - 1.0).abs() < 1e-6);
        assert!((solution.objective - 11.0).abs() < 1e-6);
    }

    #[test]
    fn test_clarabel_agrees_on_small_lp() {
        let (lp, _, _) = small_program();
        let solution = ClarabelBackend.solve(&lp).unwrap();
        assert!((solution.objective - 11.0).abs() < 1e-4);
    }

    #[test]
    fn test_clarabel_refuses_binaries() {
        let mut lp = LinearProgram::new(Direction::Maximise);
        let u = lp.add_binary("u");
        lp.add_objective_term(u, 1.0);
        assert!(matches!(ClarabelBackend.solve(&lp), Err(SolveError::Unsupported(_))));
    }

    #[test]
    fn test_binary_variable_is_integral() {
        // max x  s.t.  x <= 0.6 u + 0.2, u binary → u = 1, x = 0.8
        let mut lp = LinearProgram::new(Direction::Maximise);
        let x = lp.add_var("x", 0.0, Some(10.0));
        let u = lp.add_binary("u");
        lp.add_objective_term(x, 1.0);
        lp.add_row(ConstraintGroup::Complementarity, vec![(x, 1.0), (u, -0.6)], Sense::Le, 0.2);
        let solution = MicroLpBackend.solve(&lp).unwrap();
        assert!((solution.value(u) - 1.0).abs() < 1e-6);
        assert!((solution.value(x) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_is_not_retried() {
        let (mut lp, x, _) = small_program();
        lp.add_row(ConstraintGroup::SocBand, vec![(x, 1.0)], Sense::Ge, 5.0);

        let backend: Arc<dyn SolverBackend> = Arc::new(MicroLpBackend);
        let failure = solve_with_budget(&backend, &lp, &SolverSettings::default()).unwrap_err();
        assert_eq!(failure.error, SolveError::Infeasible);
        assert_eq!(failure.attempts, 1);

        let relaxed = lp.without_group(ConstraintGroup::SocBand);
        assert!(solve_with_budget(&backend, &relaxed, &SolverSettings::default()).is_ok());
    }

    #[test]
    fn test_band_bounds_drop_with_their_group() {
        // max x  s.t.  x in [0, 10], band [2, 3] → x = 3; without the band → x = 10
        let mut lp = LinearProgram::new(Direction::Maximise);
        let x = lp.add_var("x", 0.0, Some(10.0));
        lp.add_objective_term(x, 1.0);
        lp.set_band(x, ConstraintGroup::SocBand, 2.0, 3.0);

        assert!(lp.constrains(ConstraintGroup::SocBand));
        assert_eq!(lp.rows_in(ConstraintGroup::SocBand), 0);
        let banded = MicroLpBackend.solve(&lp).unwrap();
        assert!((banded.value(x) - 3.0).abs() < 1e-6);
        assert_eq!(banded.solver, "microlp");

        let relaxed = lp.without_group(ConstraintGroup::SocBand);
        assert!(!relaxed.constrains(ConstraintGroup::SocBand));
        let free = MicroLpBackend.solve(&relaxed).unwrap();
        assert!((free.value(x) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_budgeted_solve_refuses_to_block_an_async_runtime() {
        let (lp, _, _) = small_program();
        let backend: Arc<dyn SolverBackend> = Arc::new(MicroLpBackend);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let failure = runtime
            .block_on(async { solve_with_budget(&backend, &lp, &SolverSettings::default()) })
            .unwrap_err();
        assert!(matches!(failure.error, SolveError::Unsupported(_)));
        assert_eq!(failure.attempts, 1);

        // the same call from plain code succeeds
        assert!(solve_with_budget(&backend, &lp, &SolverSettings::default()).is_ok());
    }

    #[test]
    fn test_unrepresentable_budget_fails_without_panicking() {
        let (lp, _, _) = small_program();
        let backend: Arc<dyn SolverBackend> = Arc::new(MicroLpBackend);
        let settings = SolverSettings {
            time_limit_secs: f64::MAX,
            ..SolverSettings::default()
        };
        let failure = solve_with_budget(&backend, &lp, &settings).unwrap_err();
        assert!(matches!(failure.error, SolveError::Unsupported(_)));
    }

    struct AlwaysNumerical;

    impl SolverBackend for AlwaysNumerical {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn supports_integers(&self) -> bool {
            false
        }
        fn solve(&self, _: &LinearProgram) -> Result<LpSolution, SolveError> {
            Err(SolveError::Numerical("singular basis".to_string()))
        }
    }

    #[test]
    fn test_numerical_failure_retried_once() {
        let (lp, _, _) = small_program();
        let backend: Arc<dyn SolverBackend> = Arc::new(AlwaysNumerical);
        let failure = solve_with_budget(&backend, &lp, &SolverSettings::default()).unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(matches!(failure.error, SolveError::Numerical(_)));
    }

    struct Sleepy;

    impl SolverBackend for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }
        fn supports_integers(&self) -> bool {
            false
        }
        fn solve(&self, program: &LinearProgram) -> Result<LpSolution, SolveError> {
            std::thread::sleep(Duration::from_millis(300));
            MicroLpBackend.solve(program)
        }
    }

    #[test]
    fn test_timeout_reports_solver_failure() {
        let (lp, _, _) = small_program();
        let backend: Arc<dyn SolverBackend> = Arc::new(Sleepy);
        let settings = SolverSettings {
            time_limit_secs: 0.01,
            retry_budget_factor: 2.0,
            ..SolverSettings::default()
        };
        let failure = solve_with_budget(&backend, &lp, &settings).unwrap_err();
        assert!(matches!(failure.error, SolveError::Timeout(_)));
        assert_eq!(failure.attempts, 2);

        let engine_error = failure.into_engine_error(
            ErrorContext::new(crate::error::Stage::DayAhead, "snap"),
            Vec::new(),
        );
        assert!(matches!(engine_error, EngineError::SolverFailure { attempts: 2, .. }));
    }
}
