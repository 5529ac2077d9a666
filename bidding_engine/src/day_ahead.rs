use crate::error::{
    ConstraintGroup, ConstraintViolation, EngineError, ErrorContext, Result, RunWarning, Stage,
};
use crate::models::{
    BatteryParams, BiddingMode, Complementarity, ParameterSet, DAY_AHEAD_PERIODS, PERIODS_PER_HOUR,
};
use crate::series::DayAheadPriceSeries;
use crate::solver::{
    integer_backend, solve_with_budget, Direction, LinearProgram, LpSolution, Sense, SolveError,
    SolverBackend, VarId,
};
use log::{debug, info, warn};
use serde::Serialize;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::sync::Arc;

/// Constraint families the infeasibility diagnosis tries removing, in report order
const RELAXABLE_GROUPS: [ConstraintGroup; 5] = [
    ConstraintGroup::SocBand,
    ConstraintGroup::Ramp,
    ConstraintGroup::CycleLimit,
    ConstraintGroup::TerminalEnergy,
    ConstraintGroup::DischargeObligation,
];

/// Charge and discharge both above this count as simultaneous
const SIMULTANEOUS_TOLERANCE: f64 = 1e-6;

/// Energy slack below which two stored-energy levels are treated as equal (MWh)
const ENERGY_TOLERANCE_MWH: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    Charge,
    Discharge,
}

/// Clearing statistics of one offer segment under relative price noise N(0, σ).
///
/// The realised price is `forecast * (1 + ε)`. A discharge segment with markup `m` asks
/// `forecast + m·|forecast|` and a charge segment bids `forecast − m·|forecast|`, so a
/// positive markup is the less aggressive side in both directions and for either sign of
/// the forecast. Both clear with probability `1 − Φ(m/σ)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentEconomics {
    pub markup: f64,
    pub clearing_probability: f64,
    /// `σ·φ(m/σ)`: expected price improvement of a cleared offer, relative to |forecast|
    pub price_improvement: f64,
}

impl SegmentEconomics {
    pub fn new(markup: f64, sigma: f64) -> Self {
        let standard = Normal::standard();
        let z = markup / sigma;
        Self {
            markup,
            clearing_probability: 1.0 - standard.cdf(z),
            price_improvement: sigma * standard.pdf(z),
        }
    }

    pub fn limit_price(&self, direction: FlowDirection, forecast: f64) -> f64 {
        match direction {
            FlowDirection::Discharge => forecast + self.markup * forecast.abs(),
            FlowDirection::Charge => forecast - self.markup * forecast.abs(),
        }
    }

    /// Expected revenue per MWh offered for sale
    pub fn expected_sale_value(&self, forecast: f64) -> f64 {
        forecast * self.clearing_probability + forecast.abs() * self.price_improvement
    }

    /// Expected cost per MWh offered for purchase
    pub fn expected_purchase_cost(&self, forecast: f64) -> f64 {
        forecast * self.clearing_probability - forecast.abs() * self.price_improvement
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentOffer {
    pub direction: FlowDirection,
    pub segment: usize,
    pub quantity_mw: f64,
    pub limit_price: f64,
    pub clearing_probability: f64,
}

impl SegmentOffer {
    /// Sales clear at or above their ask, purchases at or below their bid
    pub fn clears(&self, realised_price: f64) -> bool {
        match self.direction {
            FlowDirection::Discharge => realised_price >= self.limit_price,
            FlowDirection::Charge => realised_price <= self.limit_price,
        }
    }
}

/// What is submitted to the market for one period
#[derive(Debug, Clone, Serialize)]
pub struct PeriodBid {
    pub period_index: usize,
    pub charge_offer_mw: f64,
    pub discharge_offer_mw: f64,
    /// Quantity-weighted limit price; `None` for quantity-only bids or idle periods
    pub price_bid: Option<f64>,
    pub segments: Vec<SegmentOffer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodDispatch {
    pub period_index: usize,
    pub hour: u32,
    pub minute: u32,
    pub price: f64,
    pub charge_mw: f64,
    pub discharge_mw: f64,
    pub net_mw: f64,
    /// Stored energy at the end of the period
    pub energy_mwh: f64,
    pub soc: f64,
}

/// Day-ahead dispatch rolled up to one frequency-market hour
#[derive(Debug, Clone, Serialize)]
pub struct HourlyDispatch {
    pub hour: usize,
    pub mean_price: f64,
    pub mean_charge_mw: f64,
    pub mean_discharge_mw: f64,
    pub max_abs_net_mw: f64,
    /// Lowest stored energy in the hour, including its opening level
    pub min_energy_mwh: f64,
    pub max_energy_mwh: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfitBreakdown {
    pub discharge_revenue: f64,
    pub charge_cost: f64,
    pub degradation_cost: f64,
    pub om_cost: f64,
    pub penalty_cost: f64,
    pub net_profit: f64,
    /// Grid-side energy charged plus discharged (MWh)
    pub throughput_mwh: f64,
    /// Net profit per MWh of throughput; 0 for an idle day
    pub profit_per_mwh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Optimal,
    /// Optimal after re-solving with binary charge/discharge indicators
    OptimalWithBinaries,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayAheadResult {
    pub mode: BiddingMode,
    pub schedule: Vec<PeriodDispatch>,
    pub bids: Vec<PeriodBid>,
    pub objective: f64,
    pub profit: ProfitBreakdown,
    pub cycles: f64,
    pub status: SolveStatus,
    pub solver: &'static str,
    pub warnings: Vec<RunWarning>,
}

impl DayAheadResult {
    pub fn charged_mwh(&self) -> f64 {
        self.schedule.iter().map(|p| p.charge_mw).sum::<f64>() * step_hours()
    }

    pub fn discharged_mwh(&self) -> f64 {
        self.schedule.iter().map(|p| p.discharge_mw).sum::<f64>() * step_hours()
    }

    pub fn final_soc(&self) -> f64 {
        self.schedule.last().map(|p| p.soc).unwrap_or_default()
    }

    /// Aggregate the quarter-hour schedule into 24 hourly records
    pub fn hourly_profile(&self, battery: &BatteryParams) -> Vec<HourlyDispatch> {
        let mut opening = battery.initial_energy_mwh();
        self.schedule
            .chunks(PERIODS_PER_HOUR)
            .enumerate()
            .map(|(hour, quarters)| {
                let n = quarters.len() as f64;
                let mut min_energy = opening;
                let mut max_energy = opening;
                for q in quarters {
                    min_energy = min_energy.min(q.energy_mwh);
                    max_energy = max_energy.max(q.energy_mwh);
                }
                opening = quarters.last().map(|q| q.energy_mwh).unwrap_or(opening);

                HourlyDispatch {
                    hour,
                    mean_price: quarters.iter().map(|q| q.price).sum::<f64>() / n,
                    mean_charge_mw: quarters.iter().map(|q| q.charge_mw).sum::<f64>() / n,
                    mean_discharge_mw: quarters.iter().map(|q| q.discharge_mw).sum::<f64>() / n,
                    max_abs_net_mw: quarters.iter().map(|q| q.net_mw.abs()).fold(0.0, f64::max),
                    min_energy_mwh: min_energy,
                    max_energy_mwh: max_energy,
                }
            })
            .collect()
    }
}

fn step_hours() -> f64 {
    1.0 / PERIODS_PER_HOUR as f64
}

/// Equivalent full cycles from battery-side throughput
pub fn equivalent_cycles(schedule: &[PeriodDispatch], battery: &BatteryParams) -> f64 {
    let throughput: f64 = schedule
        .iter()
        .map(|p| {
            (p.charge_mw * battery.charge_efficiency + p.discharge_mw / battery.discharge_efficiency)
                * step_hours()
        })
        .sum();
    throughput / (2.0 * battery.energy_capacity_mwh)
}

struct SegmentVar {
    direction: FlowDirection,
    segment: usize,
    var: VarId,
}

/// Variable handles of one built model
struct ModelLayout {
    charge: Vec<VarId>,
    discharge: Vec<VarId>,
    energy: Vec<VarId>,
    segments: Vec<Vec<SegmentVar>>,
    terminal_deviation: Option<(VarId, VarId)>,
}

/// Builds and solves the 96-period day-ahead bidding problem
pub struct DayAheadOptimizer<'a> {
    params: &'a ParameterSet,
    backend: Arc<dyn SolverBackend>,
    economics: Vec<SegmentEconomics>,
}

impl<'a> DayAheadOptimizer<'a> {
    pub fn new(params: &'a ParameterSet, backend: Arc<dyn SolverBackend>) -> Self {
        let sigma = params.day_ahead.price_error_std;
        let economics = params
            .day_ahead
            .segments
            .iter()
            .map(|s| SegmentEconomics::new(s.markup, sigma))
            .collect();
        Self {
            params,
            backend,
            economics,
        }
    }

    pub fn optimize(
        &self,
        prices: &DayAheadPriceSeries,
        mode: BiddingMode,
        snapshot_id: &str,
    ) -> Result<DayAheadResult> {
        let context = ErrorContext::new(Stage::DayAhead, snapshot_id).with_mode(mode);
        let formulation = self.params.day_ahead.complementarity;
        info!("Day-ahead {} solve ({:?} complementarity)", mode, formulation);

        let violations = self.structural_violations();
        if !violations.is_empty() {
            warn!("{} infeasible before solving: {:?}", context, violations);
            return Err(EngineError::Infeasible { context, violations });
        }

        let plan = match (mode, formulation) {
            (BiddingMode::QuantityAndPrice, Complementarity::Surrogate) => {
                Some(self.direction_plan(prices, &context)?)
            }
            _ => None,
        };
        let (program, layout) = self.build_program(prices, mode, formulation, plan.as_deref());
        let solution = self.solve_or_diagnose(&program, &context)?;

        if formulation == Complementarity::Binary {
            return Ok(self.extract(prices, mode, &layout, &solution, SolveStatus::Optimal, Vec::new()));
        }

        let overlapping = simultaneous_periods(&solution, &layout);
        if overlapping.is_empty() {
            return Ok(self.extract(prices, mode, &layout, &solution, SolveStatus::Optimal, Vec::new()));
        }

        warn!(
            "{} surrogate left {} period(s) charging and discharging; re-solving with binaries",
            mode,
            overlapping.len()
        );
        let (program, layout) = self.build_program(prices, mode, Complementarity::Binary, None);
        let solution = self.solve_or_diagnose(&program, &context)?;
        let warnings = vec![RunWarning::ComplementarityFallback {
            periods: overlapping.iter().map(|t| t + 1).collect(),
        }];
        Ok(self.extract(
            prices,
            mode,
            &layout,
            &solution,
            SolveStatus::OptimalWithBinaries,
            warnings,
        ))
    }

    /// One offer direction per period: the price-taker schedule's, or for idle periods
    /// the side of the daily median price. Segmented offers never straddle a period.
    fn direction_plan(&self, prices: &DayAheadPriceSeries, context: &ErrorContext) -> Result<Vec<FlowDirection>> {
        let (program, layout) =
            self.build_program(prices, BiddingMode::QuantityOnly, Complementarity::Surrogate, None);
        let solution = self.solve_or_diagnose(&program, context)?;

        let mut sorted = prices.prices();
        sorted.sort_by(f64::total_cmp);
        let median = sorted[sorted.len() / 2];

        Ok((0..DAY_AHEAD_PERIODS)
            .map(|t| {
                let net = solution.value(layout.discharge[t]) - solution.value(layout.charge[t]);
                if net > SIMULTANEOUS_TOLERANCE {
                    FlowDirection::Discharge
                } else if net < -SIMULTANEOUS_TOLERANCE {
                    FlowDirection::Charge
                } else if prices.price(t) >= median {
                    FlowDirection::Discharge
                } else {
                    FlowDirection::Charge
                }
            })
            .collect())
    }

    /// Conflicts that follow from the parameters alone, found without calling the solver.
    ///
    /// The discharge bound relaxes the model to its energy ledger: over the day the
    /// battery-side outflow `Y` and inflow `X` satisfy `Y − X ≤ E_0 − floor` and
    /// `X + Y ≤ 2·E·max_cycles`, so at most `η_dis·(E_0 − floor + 2·E·max_cycles)/2` MWh
    /// can reach the grid.
    fn structural_violations(&self) -> Vec<ConstraintViolation> {
        let b = &self.params.battery;
        let da = &self.params.day_ahead;
        let mut violations = Vec::new();

        let hard_target = match (da.terminal_soc, da.terminal_soc_penalty) {
            (Some(target), None) => Some(target * b.energy_capacity_mwh),
            _ => None,
        };
        let obligation = da.discharge_obligation_mwh;

        if self.band_collapsed() {
            let terminal_offset =
                hard_target.is_some_and(|target| (target - b.min_energy_mwh()).abs() > ENERGY_TOLERANCE_MWH);
            if obligation > 0.0 || terminal_offset {
                violations.push(ConstraintViolation {
                    group: ConstraintGroup::SocBand,
                    detail: self.describe_violation(ConstraintGroup::SocBand),
                });
            }
            return violations;
        }

        if let Some(target) = hard_target {
            if target < b.min_energy_mwh() - ENERGY_TOLERANCE_MWH
                || target > b.max_energy_mwh() + ENERGY_TOLERANCE_MWH
            {
                violations.push(ConstraintViolation {
                    group: ConstraintGroup::TerminalEnergy,
                    detail: format!(
                        "terminal SOC {:.2} lies outside the SOC band [{:.2}, {:.2}]",
                        da.terminal_soc.unwrap_or_default(),
                        b.min_soc,
                        b.max_soc
                    ),
                });
            }
        }

        if obligation > 0.0 {
            let horizon_hours = DAY_AHEAD_PERIODS as f64 * da.step_hours();
            let by_power = b.rated_power_mw * horizon_hours;
            let floor = hard_target.unwrap_or(f64::MIN).max(b.min_energy_mwh());
            let by_energy = b.discharge_efficiency
                * (b.initial_energy_mwh() - floor + 2.0 * b.energy_capacity_mwh * b.max_cycles).max(0.0)
                / 2.0;
            let deliverable = by_power.min(by_energy);
            if obligation > deliverable + ENERGY_TOLERANCE_MWH {
                violations.push(ConstraintViolation {
                    group: ConstraintGroup::DischargeObligation,
                    detail: format!(
                        "discharge obligation of {:.2} MWh exceeds the {:.2} MWh deliverable within the cycle budget",
                        obligation, deliverable
                    ),
                });
            }
        }

        violations
    }

    fn band_collapsed(&self) -> bool {
        let b = &self.params.battery;
        b.max_energy_mwh() - b.min_energy_mwh() <= ENERGY_TOLERANCE_MWH
    }

    /// Binary programs go to a backend that handles them
    fn backend_for_program(&self, program: &LinearProgram) -> Arc<dyn SolverBackend> {
        if program.has_integers() {
            integer_backend(&self.backend)
        } else {
            Arc::clone(&self.backend)
        }
    }

    fn solve_or_diagnose(&self, program: &LinearProgram, context: &ErrorContext) -> Result<LpSolution> {
        let backend = self.backend_for_program(program);
        match solve_with_budget(&backend, program, &self.params.solver) {
            Ok(solution) => Ok(solution),
            Err(failure) if failure.error == SolveError::Infeasible => {
                let violations = self.diagnose(&backend, program);
                warn!("{} infeasible; {} constraint group(s) implicated", context, violations.len());
                Err(failure.into_engine_error(context.clone(), violations))
            }
            Err(failure) => Err(failure.into_engine_error(context.clone(), Vec::new())),
        }
    }

    /// Re-solve with each relaxable group dropped and report the ones whose removal
    /// restores feasibility
    fn diagnose(&self, backend: &Arc<dyn SolverBackend>, program: &LinearProgram) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();

        for group in RELAXABLE_GROUPS {
            if !program.constrains(group) {
                continue;
            }
            let relaxed = program.without_group(group);
            if solve_with_budget(backend, &relaxed, &self.params.solver).is_ok() {
                violations.push(ConstraintViolation {
                    group,
                    detail: self.describe_violation(group),
                });
            }
        }

        if self.band_collapsed()
            && !violations.iter().any(|v| v.group == ConstraintGroup::SocBand)
        {
            violations.insert(
                0,
                ConstraintViolation {
                    group: ConstraintGroup::SocBand,
                    detail: self.describe_violation(ConstraintGroup::SocBand),
                },
            );
        }

        debug!("diagnosis: {:?}", violations);
        violations
    }

    fn describe_violation(&self, group: ConstraintGroup) -> String {
        let b = &self.params.battery;
        let da = &self.params.day_ahead;
        match group {
            ConstraintGroup::SocBand if self.band_collapsed() => format!(
                "SOC band collapsed to [{:.2}, {:.2}]; no energy headroom for any dispatch",
                b.min_soc, b.max_soc
            ),
            ConstraintGroup::SocBand => format!(
                "SOC band [{:.2}, {:.2}] ({:.1} MWh) cannot hold the required trajectory from initial SOC {:.2}",
                b.min_soc,
                b.max_soc,
                b.max_energy_mwh() - b.min_energy_mwh(),
                b.initial_soc
            ),
            ConstraintGroup::Ramp => format!("ramp limit {:.2} MW per period is too tight", b.ramp_limit_mw),
            ConstraintGroup::CycleLimit => format!("cycle budget {:.2} is too small", b.max_cycles),
            ConstraintGroup::TerminalEnergy => format!(
                "terminal SOC {:.2} is unreachable",
                da.terminal_soc.unwrap_or_default()
            ),
            ConstraintGroup::DischargeObligation => format!(
                "discharge obligation of {:.2} MWh cannot be met",
                da.discharge_obligation_mwh
            ),
            other => format!("{} rows conflict", other),
        }
    }

    fn build_program(
        &self,
        prices: &DayAheadPriceSeries,
        mode: BiddingMode,
        formulation: Complementarity,
        plan: Option<&[FlowDirection]>,
    ) -> (LinearProgram, ModelLayout) {
        let b = &self.params.battery;
        let da = &self.params.day_ahead;
        let dt = da.step_hours();
        let p_max = b.rated_power_mw;
        let wear = b.degradation_cost_per_mwh() * dt;

        let mut lp = LinearProgram::new(Direction::Maximise);
        lp.objective_constant = -b.daily_om_cost;

        let mut charge = Vec::with_capacity(DAY_AHEAD_PERIODS);
        let mut discharge = Vec::with_capacity(DAY_AHEAD_PERIODS);
        let mut energy = Vec::with_capacity(DAY_AHEAD_PERIODS);
        let mut segments = Vec::with_capacity(DAY_AHEAD_PERIODS);

        for t in 0..DAY_AHEAD_PERIODS {
            let price = prices.price(t);
            let c = lp.add_var(format!("c_{}", t), 0.0, Some(p_max));
            let d = lp.add_var(format!("d_{}", t), 0.0, Some(p_max));
            let e = lp.add_var(format!("e_{}", t), 0.0, Some(b.energy_capacity_mwh));
            lp.set_band(e, ConstraintGroup::SocBand, b.min_energy_mwh(), b.max_energy_mwh());

            // battery wear on expected throughput
            lp.add_objective_term(c, -wear * b.charge_efficiency);
            lp.add_objective_term(d, -wear / b.discharge_efficiency);

            let mut period_segments = Vec::new();
            match mode {
                BiddingMode::QuantityOnly => {
                    lp.add_objective_term(d, price * dt);
                    lp.add_objective_term(c, -price * dt);
                }
                BiddingMode::QuantityAndPrice => {
                    let mut charge_link = vec![(c, 1.0)];
                    let mut discharge_link = vec![(d, 1.0)];
                    let cap = |direction: FlowDirection, share: f64| match plan {
                        Some(plan) if plan[t] != direction => 0.0,
                        _ => share * p_max,
                    };
                    for (k, (segment, econ)) in da.segments.iter().zip(&self.economics).enumerate() {
                        let cs = lp.add_var(
                            format!("cs_{}_{}", t, k),
                            0.0,
                            Some(cap(FlowDirection::Charge, segment.share)),
                        );
                        let ds = lp.add_var(
                            format!("ds_{}_{}", t, k),
                            0.0,
                            Some(cap(FlowDirection::Discharge, segment.share)),
                        );
                        lp.add_objective_term(ds, dt * econ.expected_sale_value(price));
                        lp.add_objective_term(cs, -dt * econ.expected_purchase_cost(price));
                        charge_link.push((cs, -econ.clearing_probability));
                        discharge_link.push((ds, -econ.clearing_probability));
                        period_segments.push(SegmentVar {
                            direction: FlowDirection::Charge,
                            segment: k,
                            var: cs,
                        });
                        period_segments.push(SegmentVar {
                            direction: FlowDirection::Discharge,
                            segment: k,
                            var: ds,
                        });
                    }
                    lp.add_row(ConstraintGroup::SegmentLink, charge_link, Sense::Eq, 0.0);
                    lp.add_row(ConstraintGroup::SegmentLink, discharge_link, Sense::Eq, 0.0);
                }
            }

            // exclusivity applies to what is offered, which bounds what is dispatched
            let (offered_charge, offered_discharge): (Vec<(VarId, f64)>, Vec<(VarId, f64)>) = match mode {
                BiddingMode::QuantityOnly => (vec![(c, 1.0)], vec![(d, 1.0)]),
                BiddingMode::QuantityAndPrice => (
                    period_segments
                        .iter()
                        .filter(|s| s.direction == FlowDirection::Charge)
                        .map(|s| (s.var, 1.0))
                        .collect(),
                    period_segments
                        .iter()
                        .filter(|s| s.direction == FlowDirection::Discharge)
                        .map(|s| (s.var, 1.0))
                        .collect(),
                ),
            };
            match formulation {
                Complementarity::Surrogate => {
                    let mut both = offered_charge.clone();
                    both.extend(offered_discharge.iter().copied());
                    lp.add_row(ConstraintGroup::Complementarity, both, Sense::Le, p_max);
                }
                Complementarity::Binary => {
                    let u = lp.add_binary(format!("u_{}", t));
                    let mut charge_side = offered_charge.clone();
                    charge_side.push((u, -p_max));
                    lp.add_row(ConstraintGroup::Complementarity, charge_side, Sense::Le, 0.0);
                    let mut discharge_side = offered_discharge.clone();
                    discharge_side.push((u, p_max));
                    lp.add_row(ConstraintGroup::Complementarity, discharge_side, Sense::Le, p_max);
                }
            }
            if mode == BiddingMode::QuantityAndPrice {
                lp.add_row(ConstraintGroup::PowerLimit, offered_charge, Sense::Le, p_max);
                lp.add_row(ConstraintGroup::PowerLimit, offered_discharge, Sense::Le, p_max);
            }

            // E_t - E_{t-1} - η_ch·Δt·c_t + Δt/η_dis·d_t = 0
            let mut balance = vec![
                (e, 1.0),
                (c, -b.charge_efficiency * dt),
                (d, dt / b.discharge_efficiency),
            ];
            let rhs = if t == 0 {
                b.initial_energy_mwh()
            } else {
                balance.push((energy[t - 1], -1.0));
                0.0
            };
            lp.add_row(ConstraintGroup::EnergyBalance, balance, Sense::Eq, rhs);

            // net power p = d - c, p_{-1} = 0
            let mut ramp = vec![(d, 1.0), (c, -1.0)];
            if t > 0 {
                ramp.push((discharge[t - 1], -1.0));
                ramp.push((charge[t - 1], 1.0));
            }
            lp.add_row(ConstraintGroup::Ramp, ramp.clone(), Sense::Le, b.ramp_limit_mw);
            lp.add_row(ConstraintGroup::Ramp, ramp, Sense::Ge, -b.ramp_limit_mw);

            charge.push(c);
            discharge.push(d);
            energy.push(e);
            segments.push(period_segments);
        }

        let throughput: Vec<(VarId, f64)> = charge
            .iter()
            .map(|&c| (c, b.charge_efficiency * dt))
            .chain(discharge.iter().map(|&d| (d, dt / b.discharge_efficiency)))
            .collect();
        lp.add_row(
            ConstraintGroup::CycleLimit,
            throughput,
            Sense::Le,
            2.0 * b.energy_capacity_mwh * b.max_cycles,
        );

        let mut terminal_deviation = None;
        if let Some(target) = da.terminal_soc {
            let last = energy[DAY_AHEAD_PERIODS - 1];
            let target_mwh = target * b.energy_capacity_mwh;
            match da.terminal_soc_penalty {
                Some(weight) => {
                    let over = lp.add_var("terminal_over", 0.0, None);
                    let under = lp.add_var("terminal_under", 0.0, None);
                    lp.add_objective_term(over, -weight);
                    lp.add_objective_term(under, -weight);
                    lp.add_row(
                        ConstraintGroup::TerminalEnergy,
                        vec![(last, 1.0), (over, -1.0), (under, 1.0)],
                        Sense::Eq,
                        target_mwh,
                    );
                    terminal_deviation = Some((over, under));
                }
                None => {
                    lp.add_row(ConstraintGroup::TerminalEnergy, vec![(last, 1.0)], Sense::Eq, target_mwh);
                }
            }
        }

        if da.discharge_obligation_mwh > 0.0 {
            lp.add_row(
                ConstraintGroup::DischargeObligation,
                discharge.iter().map(|&d| (d, dt)).collect(),
                Sense::Ge,
                da.discharge_obligation_mwh,
            );
        }

        debug!(
            "{} model: {} variables, {} rows",
            mode,
            lp.vars.len(),
            lp.rows.len()
        );

        let layout = ModelLayout {
            charge,
            discharge,
            energy,
            segments,
            terminal_deviation,
        };
        (lp, layout)
    }

    fn extract(
        &self,
        prices: &DayAheadPriceSeries,
        mode: BiddingMode,
        layout: &ModelLayout,
        solution: &LpSolution,
        status: SolveStatus,
        warnings: Vec<RunWarning>,
    ) -> DayAheadResult {
        let b = &self.params.battery;
        let da = &self.params.day_ahead;
        let dt = da.step_hours();

        let schedule: Vec<PeriodDispatch> = prices
            .points()
            .iter()
            .enumerate()
            .map(|(t, point)| {
                let charge_mw = solution.value(layout.charge[t]);
                let discharge_mw = solution.value(layout.discharge[t]);
                let energy_mwh = solution.value(layout.energy[t]);
                PeriodDispatch {
                    period_index: point.period_index,
                    hour: point.hour,
                    minute: point.minute,
                    price: point.price,
                    charge_mw,
                    discharge_mw,
                    net_mw: discharge_mw - charge_mw,
                    energy_mwh,
                    soc: energy_mwh / b.energy_capacity_mwh,
                }
            })
            .collect();

        let mut bids = Vec::with_capacity(DAY_AHEAD_PERIODS);
        let mut discharge_revenue = 0.0;
        let mut charge_cost = 0.0;

        for (t, dispatch) in schedule.iter().enumerate() {
            let price = dispatch.price;
            match mode {
                BiddingMode::QuantityOnly => {
                    discharge_revenue += price * dispatch.discharge_mw * dt;
                    charge_cost += price * dispatch.charge_mw * dt;
                    bids.push(PeriodBid {
                        period_index: dispatch.period_index,
                        charge_offer_mw: dispatch.charge_mw,
                        discharge_offer_mw: dispatch.discharge_mw,
                        price_bid: None,
                        segments: Vec::new(),
                    });
                }
                BiddingMode::QuantityAndPrice => {
                    let mut offers = Vec::new();
                    for sv in &layout.segments[t] {
                        let quantity = solution.value(sv.var);
                        if quantity <= 0.0 {
                            continue;
                        }
                        let econ = &self.economics[sv.segment];
                        match sv.direction {
                            FlowDirection::Discharge => discharge_revenue += dt * econ.expected_sale_value(price) * quantity,
                            FlowDirection::Charge => charge_cost += dt * econ.expected_purchase_cost(price) * quantity,
                        }
                        offers.push(SegmentOffer {
                            direction: sv.direction,
                            segment: sv.segment,
                            quantity_mw: quantity,
                            limit_price: econ.limit_price(sv.direction, price),
                            clearing_probability: econ.clearing_probability,
                        });
                    }
                    bids.push(period_bid(dispatch.period_index, offers));
                }
            }
        }

        let cycles = equivalent_cycles(&schedule, b);
        let penalty_cost = match (layout.terminal_deviation, da.terminal_soc_penalty) {
            (Some((over, under)), Some(weight)) => weight * (solution.value(over) + solution.value(under)),
            _ => 0.0,
        };
        let degradation_cost = cycles * b.degradation_cost_per_cycle;
        let om_cost = b.daily_om_cost;
        let net_profit = discharge_revenue - charge_cost - degradation_cost - om_cost - penalty_cost;
        let throughput_mwh: f64 = schedule.iter().map(|p| (p.charge_mw + p.discharge_mw) * dt).sum();
        let profit_per_mwh = if throughput_mwh > 0.0 {
            net_profit / throughput_mwh
        } else {
            0.0
        };

        let objective = solution.objective;
        info!(
            "{} optimal: profit {:.2}, {:.3} cycles, {:.2} MWh discharged",
            mode,
            net_profit,
            cycles,
            schedule.iter().map(|p| p.discharge_mw).sum::<f64>() * dt
        );

        DayAheadResult {
            mode,
            schedule,
            bids,
            objective,
            profit: ProfitBreakdown {
                discharge_revenue,
                charge_cost,
                degradation_cost,
                om_cost,
                penalty_cost,
                net_profit,
                throughput_mwh,
                profit_per_mwh,
            },
            cycles,
            status,
            solver: solution.solver,
            warnings,
        }
    }
}

fn period_bid(period_index: usize, offers: Vec<SegmentOffer>) -> PeriodBid {
    let total = |direction: FlowDirection| -> f64 {
        offers
            .iter()
            .filter(|o| o.direction == direction)
            .map(|o| o.quantity_mw)
            .sum()
    };
    let charge_offer_mw = total(FlowDirection::Charge);
    let discharge_offer_mw = total(FlowDirection::Discharge);

    let active = if discharge_offer_mw >= charge_offer_mw {
        FlowDirection::Discharge
    } else {
        FlowDirection::Charge
    };
    let active_total = charge_offer_mw.max(discharge_offer_mw);
    let price_bid = (active_total > 0.0).then(|| {
        offers
            .iter()
            .filter(|o| o.direction == active)
            .map(|o| o.limit_price * o.quantity_mw)
            .sum::<f64>()
            / active_total
    });

    PeriodBid {
        period_index,
        charge_offer_mw,
        discharge_offer_mw,
        price_bid,
        segments: offers,
    }
}

fn simultaneous_periods(solution: &LpSolution, layout: &ModelLayout) -> Vec<usize> {
    (0..layout.charge.len())
        .filter(|&t| {
            solution.value(layout.charge[t]) > SIMULTANEOUS_TOLERANCE
                && solution.value(layout.discharge[t]) > SIMULTANEOUS_TOLERANCE
        })
        .collect()
}

/// Convenience for callers holding only a parameter set
pub fn optimize_day_ahead(
    params: &ParameterSet,
    backend: Arc<dyn SolverBackend>,
    prices: &DayAheadPriceSeries,
    mode: BiddingMode,
    snapshot_id: &str,
) -> Result<DayAheadResult> {
    DayAheadOptimizer::new(params, backend).optimize(prices, mode, snapshot_id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::SolverKind;
    use crate::solver::{backend_for, MicroLpBackend};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::Distribution;

    const TOL: f64 = 1e-6;

    pub(crate) fn scenario_params() -> ParameterSet {
        let mut params = ParameterSet::default();
        params.battery.rated_power_mw = 10.0;
        params.battery.energy_capacity_mwh = 40.0;
        params.battery.charge_efficiency = 0.95;
        params.battery.discharge_efficiency = 0.95;
        params.battery.min_soc = 0.2;
        params.battery.max_soc = 0.8;
        params.battery.ramp_limit_mw = 10.0;
        params.battery.max_cycles = 2.0;
        params
    }

    /// Cheap overnight window, expensive evening window
    pub(crate) fn two_window_prices() -> DayAheadPriceSeries {
        let prices: Vec<f64> = (0..DAY_AHEAD_PERIODS)
            .map(|t| match t {
                8..=31 => 80.0,
                68..=87 => 520.0,
                _ => 300.0,
            })
            .collect();
        DayAheadPriceSeries::from_prices(&prices).unwrap()
    }

    fn backend() -> Arc<dyn SolverBackend> {
        Arc::new(MicroLpBackend)
    }

    fn assert_physical(result: &DayAheadResult, params: &ParameterSet) {
        let b = &params.battery;
        let dt = 0.25;
        let mut previous = b.initial_energy_mwh();
        for p in &result.schedule {
            assert!(p.soc >= b.min_soc - TOL && p.soc <= b.max_soc + TOL, "SOC {} out of band", p.soc);
            let expected = previous + p.charge_mw * b.charge_efficiency * dt - p.discharge_mw * dt / b.discharge_efficiency;
            assert!((p.energy_mwh - expected).abs() < TOL, "recursion broken at period {}", p.period_index);
            assert!(
                !(p.charge_mw > TOL && p.discharge_mw > TOL),
                "simultaneous charge/discharge at period {}",
                p.period_index
            );
            assert!(p.charge_mw >= 0.0 && p.discharge_mw >= 0.0);
            previous = p.energy_mwh;
        }
        assert!(result.cycles <= b.max_cycles + TOL);
    }

    #[test]
    fn test_flat_prices_produce_no_activity() {
        let params = scenario_params();
        let prices = DayAheadPriceSeries::from_prices(&vec![300.0; 96]).unwrap();
        let result = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityOnly, "flat").unwrap();

        assert_physical(&result, &params);
        assert!(result.charged_mwh() < TOL);
        assert!(result.discharged_mwh() < TOL);
        assert!((result.profit.net_profit + params.battery.daily_om_cost).abs() < 1e-4);
        assert!(result.profit.throughput_mwh < TOL);
    }

    #[test]
    fn test_two_window_arbitrage() {
        let params = scenario_params();
        let result = optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "arb").unwrap();

        assert_physical(&result, &params);
        assert!(result.profit.net_profit > 0.0);

        let charged_cheap: f64 = result.schedule[8..32].iter().map(|p| p.charge_mw).sum();
        let discharged_peak: f64 = result.schedule[68..88].iter().map(|p| p.discharge_mw).sum();
        let charged_peak: f64 = result.schedule[68..88].iter().map(|p| p.charge_mw).sum();
        assert!(charged_cheap > 0.0);
        assert!(discharged_peak > 0.0);
        assert!(charged_peak < TOL);
    }

    #[test]
    fn test_profit_matches_objective() {
        let params = scenario_params();
        let result = optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "obj").unwrap();
        assert!((result.profit.net_profit - result.objective).abs() < 1e-4);

        let throughput = result.charged_mwh() + result.discharged_mwh();
        assert!((result.profit.throughput_mwh - throughput).abs() < 1e-9);
        assert!((result.profit.profit_per_mwh * throughput - result.profit.net_profit).abs() < 1e-6);
    }

    #[test]
    fn test_profit_monotonic_in_cycle_budget() {
        let mut last = f64::NEG_INFINITY;
        for max_cycles in [0.25, 0.5, 1.0, 2.0] {
            let mut params = scenario_params();
            params.battery.max_cycles = max_cycles;
            let result =
                optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "cyc").unwrap();
            assert!(result.cycles <= max_cycles + TOL);
            assert!(result.profit.net_profit >= last - 1e-6);
            last = result.profit.net_profit;
        }
    }

    #[test]
    fn test_ramp_limit_respected() {
        let mut params = scenario_params();
        params.battery.ramp_limit_mw = 1.5;
        let result = optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "ramp").unwrap();

        let mut previous = 0.0;
        for p in &result.schedule {
            assert!((p.net_mw - previous).abs() <= 1.5 + TOL);
            previous = p.net_mw;
        }
    }

    #[test]
    fn test_quantity_and_price_bids_stay_in_band() {
        let params = scenario_params();
        let prices = two_window_prices();
        let result = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityAndPrice, "qp").unwrap();

        assert_physical(&result, &params);
        assert!(result.profit.net_profit > 0.0);

        let band = params.day_ahead.price_band;
        for bid in &result.bids {
            if let Some(price_bid) = bid.price_bid {
                let forecast = prices.price(bid.period_index - 1);
                assert!(price_bid >= forecast * (1.0 - band) - TOL);
                assert!(price_bid <= forecast * (1.0 + band) + TOL);
            }
            assert!(bid.charge_offer_mw + bid.discharge_offer_mw <= params.battery.rated_power_mw + TOL);
        }
    }

    #[test]
    fn test_collapsed_band_is_infeasible_with_soc_note() {
        let mut params = scenario_params();
        params.battery.min_soc = 0.5;
        params.battery.max_soc = 0.5;
        params.day_ahead.discharge_obligation_mwh = 5.0;

        let err = optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "snap42")
            .unwrap_err();

        assert!(err.is_infeasible());
        assert!(err.violations().iter().any(|v| v.group == ConstraintGroup::SocBand));
        let message = err.to_string();
        assert!(message.contains("snap42"));
        assert!(message.contains("collapsed"));
    }

    /// Fails every solve, so a result proves the solver was never reached
    struct NoSolver;

    impl SolverBackend for NoSolver {
        fn name(&self) -> &'static str {
            "none"
        }
        fn supports_integers(&self) -> bool {
            true
        }
        fn solve(&self, _: &LinearProgram) -> std::result::Result<LpSolution, SolveError> {
            Err(SolveError::Unsupported("solver must not be called"))
        }
    }

    #[test]
    fn test_structural_conflicts_reported_without_solving() {
        let mut params = scenario_params();
        params.battery.min_soc = 0.5;
        params.battery.max_soc = 0.5;
        params.day_ahead.discharge_obligation_mwh = 5.0;
        for mode in BiddingMode::all() {
            let err = optimize_day_ahead(&params, Arc::new(NoSolver), &two_window_prices(), mode, "band").unwrap_err();
            assert!(err.is_infeasible(), "{}", err);
            assert_eq!(err.violations()[0].group, ConstraintGroup::SocBand);
        }

        // 40 MWh, 2 cycles, starting at 0.5 and ending at 0.5: at most 0.95 * 160 / 2 = 76 MWh
        let mut params = scenario_params();
        params.day_ahead.discharge_obligation_mwh = 80.0;
        let err = optimize_day_ahead(&params, Arc::new(NoSolver), &two_window_prices(), BiddingMode::QuantityOnly, "ob")
            .unwrap_err();
        assert!(err.is_infeasible(), "{}", err);
        assert_eq!(err.violations()[0].group, ConstraintGroup::DischargeObligation);
    }

    #[test]
    fn test_collapsed_band_without_obligation_stays_idle() {
        let mut params = scenario_params();
        params.battery.min_soc = 0.5;
        params.battery.max_soc = 0.5;

        let result = optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "idle").unwrap();
        assert!(result.discharged_mwh() < TOL);
        assert!((result.final_soc() - 0.5).abs() < TOL);
    }

    #[test]
    fn test_feasible_obligation_is_delivered() {
        let mut params = scenario_params();
        params.day_ahead.discharge_obligation_mwh = 20.0;
        let prices = DayAheadPriceSeries::from_prices(&vec![300.0; 96]).unwrap();

        let result = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityOnly, "deliver").unwrap();
        assert_physical(&result, &params);
        assert!(result.discharged_mwh() >= 20.0 - 1e-6);
    }

    #[test]
    fn test_soft_terminal_target_pays_penalty_instead_of_failing() {
        let mut params = scenario_params();
        params.battery.initial_soc = 0.2;
        params.battery.max_cycles = 0.05;
        params.day_ahead.terminal_soc = Some(0.8);
        params.day_ahead.terminal_soc_penalty = Some(1000.0);

        let prices = DayAheadPriceSeries::from_prices(&vec![300.0; 96]).unwrap();
        let result = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityOnly, "soft").unwrap();
        assert!(result.profit.penalty_cost > 0.0);

        params.day_ahead.terminal_soc_penalty = None;
        let err = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityOnly, "hard").unwrap_err();
        let groups: Vec<_> = err.violations().iter().map(|v| v.group).collect();
        assert!(groups.contains(&ConstraintGroup::CycleLimit));
        assert!(groups.contains(&ConstraintGroup::TerminalEnergy));
    }

    #[test]
    fn test_binary_formulation_matches_surrogate_on_positive_prices() {
        let params = scenario_params();
        let mut binary = scenario_params();
        binary.day_ahead.complementarity = Complementarity::Binary;
        let prices = two_window_prices();

        let a = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityOnly, "s").unwrap();
        let b = optimize_day_ahead(&binary, backend(), &prices, BiddingMode::QuantityOnly, "b").unwrap();
        assert_physical(&b, &binary);
        assert!((a.profit.net_profit - b.profit.net_profit).abs() < 1e-3);
    }

    #[test]
    fn test_binary_formulation_runs_on_continuous_backend() {
        let mut params = scenario_params();
        params.solver.backend = SolverKind::Clarabel;
        params.day_ahead.complementarity = Complementarity::Binary;

        let result = optimize_day_ahead(
            &params,
            backend_for(params.solver.backend),
            &two_window_prices(),
            BiddingMode::QuantityOnly,
            "clarabel",
        )
        .unwrap();
        assert_physical(&result, &params);
        assert_eq!(result.solver, "microlp");
        assert!(result.profit.net_profit > 0.0);
    }

    #[test]
    fn test_surrogate_overlap_falls_back_to_binaries() {
        // A full battery can only take paid energy in the first hour by discharging at the
        // same time
        let mut params = scenario_params();
        params.battery.initial_soc = 0.8;
        params.battery.max_cycles = 4.0;
        let prices: Vec<f64> = (0..DAY_AHEAD_PERIODS)
            .map(|t| if t < 4 { -200.0 } else { 300.0 })
            .collect();
        let prices = DayAheadPriceSeries::from_prices(&prices).unwrap();

        let result = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityOnly, "neg").unwrap();

        assert_eq!(result.status, SolveStatus::OptimalWithBinaries);
        assert_physical(&result, &params);
        match result.warnings.as_slice() {
            [RunWarning::ComplementarityFallback { periods }] => assert!(!periods.is_empty()),
            other => panic!("expected one complementarity fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_quantity_and_price_on_negative_prices() {
        let params = scenario_params();
        let prices: Vec<f64> = (0..DAY_AHEAD_PERIODS)
            .map(|t| match t {
                8..=31 => -200.0,
                68..=87 => 520.0,
                _ => 300.0,
            })
            .collect();
        let prices = DayAheadPriceSeries::from_prices(&prices).unwrap();

        let result = optimize_day_ahead(&params, backend(), &prices, BiddingMode::QuantityAndPrice, "negqp").unwrap();
        assert_physical(&result, &params);
        assert!(result.profit.net_profit > 0.0);

        let charged_negative: f64 = result.schedule[8..32].iter().map(|p| p.charge_mw).sum();
        assert!(charged_negative > 0.0);

        let band = params.day_ahead.price_band;
        for bid in &result.bids {
            let forecast = prices.price(bid.period_index - 1);
            for offer in &bid.segments {
                assert!((offer.limit_price - forecast).abs() <= band * forecast.abs() + TOL);
            }
            if let Some(price_bid) = bid.price_bid {
                assert!((price_bid - forecast).abs() <= band * forecast.abs() + TOL);
            }
        }
    }

    #[test]
    fn test_hourly_profile_includes_opening_energy() {
        let params = scenario_params();
        let result = optimize_day_ahead(&params, backend(), &two_window_prices(), BiddingMode::QuantityOnly, "h").unwrap();
        let hourly = result.hourly_profile(&params.battery);

        assert_eq!(hourly.len(), 24);
        assert!(hourly[0].min_energy_mwh <= params.battery.initial_energy_mwh() + TOL);
        assert!(hourly[0].max_energy_mwh >= params.battery.initial_energy_mwh() - TOL);
        for h in &hourly {
            assert!(h.min_energy_mwh <= h.max_energy_mwh);
        }
    }

    fn offer(econ: &SegmentEconomics, direction: FlowDirection, forecast: f64) -> SegmentOffer {
        SegmentOffer {
            direction,
            segment: 0,
            quantity_mw: 1.0,
            limit_price: econ.limit_price(direction, forecast),
            clearing_probability: econ.clearing_probability,
        }
    }

    #[test]
    fn test_segment_economics() {
        let econ = SegmentEconomics::new(0.0, 0.15);
        assert!((econ.clearing_probability - 0.5).abs() < 1e-12);
        assert!(econ.expected_sale_value(100.0) > 50.0);
        assert!(econ.expected_purchase_cost(100.0) < 50.0);

        let cautious = SegmentEconomics::new(0.15, 0.15);
        assert!(cautious.clearing_probability < econ.clearing_probability);
        assert!(offer(&cautious, FlowDirection::Discharge, 100.0).clears(120.0));
        assert!(!offer(&cautious, FlowDirection::Charge, 100.0).clears(100.0));
        assert!(offer(&cautious, FlowDirection::Charge, 100.0).clears(80.0));
    }

    #[test]
    fn test_negative_forecast_offers_clear_against_their_limit() {
        let econ = SegmentEconomics::new(0.05, 0.15);

        let buy = offer(&econ, FlowDirection::Charge, -200.0);
        assert!((buy.limit_price + 210.0).abs() < 1e-9);
        assert!(buy.clears(-220.0));
        assert!(!buy.clears(-200.0));

        let sell = offer(&econ, FlowDirection::Discharge, -200.0);
        assert!((sell.limit_price + 190.0).abs() < 1e-9);
        assert!(sell.clears(-180.0));
        assert!(!sell.clears(-200.0));
    }

    #[test]
    fn test_expected_values_match_sampled_settlement() {
        let sigma = 0.15;
        let econ = SegmentEconomics::new(0.05, sigma);
        let noise = rand_distr::Normal::new(0.0, sigma).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 40_000;

        for forecast in [-200.0, 150.0] {
            let buy = offer(&econ, FlowDirection::Charge, forecast);
            let sell = offer(&econ, FlowDirection::Discharge, forecast);
            let (mut bought, mut paid, mut sold, mut earned) = (0usize, 0.0, 0usize, 0.0);
            for _ in 0..draws {
                let realised = forecast * (1.0 + noise.sample(&mut rng));
                if buy.clears(realised) {
                    bought += 1;
                    paid += realised;
                }
                if sell.clears(realised) {
                    sold += 1;
                    earned += realised;
                }
            }
            let n = draws as f64;
            assert!((bought as f64 / n - econ.clearing_probability).abs() < 0.01);
            assert!((sold as f64 / n - econ.clearing_probability).abs() < 0.01);
            assert!((paid / n - econ.expected_purchase_cost(forecast)).abs() < 2.0);
            assert!((earned / n - econ.expected_sale_value(forecast)).abs() < 2.0);
        }
    }
}
