use crate::day_ahead::{DayAheadOptimizer, DayAheadResult, FlowDirection};
use crate::error::{EngineError, Result, RunWarning};
use crate::models::{BiddingMode, ParameterSet, PERIODS_PER_HOUR};
use crate::series::DayAheadPriceSeries;
use crate::solver::SolverBackend;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::sync::Arc;

/// Summary of a simulated profit distribution
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProfitStats {
    pub mean: f64,
    pub std_dev: f64,
    pub p05: f64,
    pub p95: f64,
    pub scenarios: usize,
}

impl ProfitStats {
    fn point(value: f64) -> Self {
        Self {
            mean: value,
            std_dev: 0.0,
            p05: value,
            p95: value,
            scenarios: 0,
        }
    }

    fn from_samples(mut samples: Vec<f64>) -> Self {
        let n = samples.len();
        if n == 0 {
            return Self::default();
        }
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        samples.sort_by(f64::total_cmp);
        let quantile = |q: f64| samples[((n - 1) as f64 * q).round() as usize];
        Self {
            mean,
            std_dev: variance.sqrt(),
            p05: quantile(0.05),
            p95: quantile(0.95),
            scenarios: n,
        }
    }
}

/// Outcome of choosing between the two bidding modes
#[derive(Debug, Clone, Serialize)]
pub struct ModeDecision {
    pub selected: BiddingMode,
    pub result: DayAheadResult,
    /// `None` when only one candidate could be solved
    pub rarr: Option<f64>,
    pub quantity_only_profit: Option<f64>,
    pub quantity_and_price_profit: Option<f64>,
    pub quantity_only_stats: Option<ProfitStats>,
    pub quantity_and_price_stats: Option<ProfitStats>,
    pub fallback: Option<RunWarning>,
}

impl ModeDecision {
    /// Warnings of the selected schedule plus any fallback note
    pub fn warnings(&self) -> Vec<RunWarning> {
        let mut warnings = self.result.warnings.clone();
        warnings.extend(self.fallback.clone());
        warnings
    }
}

/// `(R_qp - R_qo) / (σ_qp + ε)`
pub fn risk_adjusted_revenue_ratio(qp_profit: f64, qo_profit: f64, qp_std: f64, epsilon: f64) -> f64 {
    (qp_profit - qo_profit) / (qp_std + epsilon)
}

pub struct ModeSelector<'a> {
    params: &'a ParameterSet,
    backend: Arc<dyn SolverBackend>,
}

impl<'a> ModeSelector<'a> {
    pub fn new(params: &'a ParameterSet, backend: Arc<dyn SolverBackend>) -> Self {
        Self { params, backend }
    }

    pub fn select(&self, prices: &DayAheadPriceSeries, snapshot_id: &str) -> Result<ModeDecision> {
        let optimizer = DayAheadOptimizer::new(self.params, Arc::clone(&self.backend));
        let solve = |mode| optimizer.optimize(prices, mode, snapshot_id);

        let (quantity_only, quantity_and_price) = if self.params.mode_selection.parallel {
            rayon::join(
                || solve(BiddingMode::QuantityOnly),
                || solve(BiddingMode::QuantityAndPrice),
            )
        } else {
            (solve(BiddingMode::QuantityOnly), solve(BiddingMode::QuantityAndPrice))
        };

        match (quantity_only, quantity_and_price) {
            (Ok(qo), Ok(qp)) => self.decide(prices, qo, qp),
            (Ok(qo), Err(err)) => {
                warn!("quantity-and-price candidate failed: {}", err);
                Ok(self.single(BiddingMode::QuantityAndPrice, qo, err.to_string()))
            }
            (Err(err), Ok(qp)) => {
                warn!("quantity-only candidate failed: {}", err);
                Ok(self.single(BiddingMode::QuantityOnly, qp, err.to_string()))
            }
            (Err(err), Err(_)) => Err(err),
        }
    }

    fn decide(
        &self,
        prices: &DayAheadPriceSeries,
        qo: DayAheadResult,
        qp: DayAheadResult,
    ) -> Result<ModeDecision> {
        let settings = &self.params.mode_selection;
        let (qo_stats, qp_stats) = self.simulate(prices, &qo, &qp)?;

        let qo_profit = qo.profit.net_profit;
        let qp_profit = qp.profit.net_profit;
        let rarr = risk_adjusted_revenue_ratio(qp_profit, qo_profit, qp_stats.std_dev, settings.epsilon);

        let selected = if rarr > settings.rarr_threshold {
            BiddingMode::QuantityAndPrice
        } else {
            BiddingMode::QuantityOnly
        };
        info!(
            "RARR {:.4} (qo {:.2}, qp {:.2} ± {:.2}) → {}",
            rarr, qo_profit, qp_profit, qp_stats.std_dev, selected
        );

        let result = match selected {
            BiddingMode::QuantityOnly => qo,
            BiddingMode::QuantityAndPrice => qp,
        };
        Ok(ModeDecision {
            selected,
            result,
            rarr: Some(rarr),
            quantity_only_profit: Some(qo_profit),
            quantity_and_price_profit: Some(qp_profit),
            quantity_only_stats: Some(qo_stats),
            quantity_and_price_stats: Some(qp_stats),
            fallback: None,
        })
    }

    fn single(&self, failed_mode: BiddingMode, survivor: DayAheadResult, reason: String) -> ModeDecision {
        let profit = survivor.profit.net_profit;
        let (quantity_only_profit, quantity_and_price_profit) = match survivor.mode {
            BiddingMode::QuantityOnly => (Some(profit), None),
            BiddingMode::QuantityAndPrice => (None, Some(profit)),
        };
        ModeDecision {
            selected: survivor.mode,
            result: survivor,
            rarr: None,
            quantity_only_profit,
            quantity_and_price_profit,
            quantity_only_stats: None,
            quantity_and_price_stats: None,
            fallback: Some(RunWarning::ModeFallback { failed_mode, reason }),
        }
    }

    /// Settle both schedules against the same seeded price scenarios
    fn simulate(
        &self,
        prices: &DayAheadPriceSeries,
        qo: &DayAheadResult,
        qp: &DayAheadResult,
    ) -> Result<(ProfitStats, ProfitStats)> {
        let settings = &self.params.mode_selection;
        let sigma = self.params.day_ahead.price_error_std;
        if settings.scenario_count == 0 {
            return Ok((ProfitStats::point(qo.profit.net_profit), ProfitStats::point(qp.profit.net_profit)));
        }

        let dt = 1.0 / PERIODS_PER_HOUR as f64;
        let fixed_costs = |r: &DayAheadResult| r.profit.degradation_cost + r.profit.om_cost + r.profit.penalty_cost;
        let (qo_fixed, qp_fixed) = (fixed_costs(qo), fixed_costs(qp));

        let mut rng = StdRng::seed_from_u64(settings.seed);
        let noise = Normal::new(0.0, sigma)
            .map_err(|e| EngineError::parameter("day_ahead.price_error_std", e.to_string()))?;

        let mut qo_samples = Vec::with_capacity(settings.scenario_count);
        let mut qp_samples = Vec::with_capacity(settings.scenario_count);
        let mut epsilons = vec![0.0; prices.points().len()];

        for _ in 0..settings.scenario_count {
            for eps in epsilons.iter_mut() {
                *eps = noise.sample(&mut rng);
            }

            let qo_revenue: f64 = qo
                .schedule
                .iter()
                .zip(&epsilons)
                .map(|(p, eps)| p.price * (1.0 + eps) * p.net_mw * dt)
                .sum();

            let qp_revenue: f64 = qp
                .bids
                .iter()
                .zip(qp.schedule.iter())
                .zip(&epsilons)
                .map(|((bid, p), &eps)| {
                    let realised = p.price * (1.0 + eps);
                    bid.segments
                        .iter()
                        .filter(|o| o.clears(realised))
                        .map(|o| match o.direction {
                            FlowDirection::Discharge => realised * o.quantity_mw * dt,
                            FlowDirection::Charge => -realised * o.quantity_mw * dt,
                        })
                        .sum::<f64>()
                })
                .sum();

            qo_samples.push(qo_revenue - qo_fixed);
            qp_samples.push(qp_revenue - qp_fixed);
        }

        Ok((ProfitStats::from_samples(qo_samples), ProfitStats::from_samples(qp_samples)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::day_ahead::tests::{scenario_params, two_window_prices};
    use crate::solver::{LinearProgram, LpSolution, MicroLpBackend, SolveError};

    fn backend() -> Arc<dyn SolverBackend> {
        Arc::new(MicroLpBackend)
    }

    /// Solves quantity-only models and fails any model with quoted sale offers
    struct QuotedOffersFail;

    impl SolverBackend for QuotedOffersFail {
        fn name(&self) -> &'static str {
            "quoted-offers-fail"
        }
        fn supports_integers(&self) -> bool {
            true
        }
        fn solve(&self, program: &LinearProgram) -> std::result::Result<LpSolution, SolveError> {
            if program.vars.iter().any(|v| v.name.starts_with("ds_")) {
                Err(SolveError::Numerical("quoted offers rejected".to_string()))
            } else {
                MicroLpBackend.solve(program)
            }
        }
    }

    #[test]
    fn test_rarr_formula() {
        assert!((risk_adjusted_revenue_ratio(110.0, 100.0, 5.0, 1e-9) - 2.0).abs() < 1e-6);
        assert!(risk_adjusted_revenue_ratio(90.0, 100.0, 5.0, 1e-9) < 0.0);
        // zero spread stays finite
        assert!(risk_adjusted_revenue_ratio(100.0, 100.0, 0.0, 1e-9).is_finite());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let params = scenario_params();
        let prices = two_window_prices();

        let a = ModeSelector::new(&params, backend()).select(&prices, "det").unwrap();
        let b = ModeSelector::new(&params, backend()).select(&prices, "det").unwrap();

        assert_eq!(a.selected, b.selected);
        assert_eq!(a.rarr, b.rarr);
        assert_eq!(a.quantity_and_price_stats, b.quantity_and_price_stats);
    }

    #[test]
    fn test_decision_follows_threshold() {
        let mut params = scenario_params();
        let prices = two_window_prices();

        params.mode_selection.rarr_threshold = f64::MAX;
        let decision = ModeSelector::new(&params, backend()).select(&prices, "hi").unwrap();
        assert_eq!(decision.selected, BiddingMode::QuantityOnly);
        assert_eq!(decision.result.mode, BiddingMode::QuantityOnly);

        params.mode_selection.rarr_threshold = f64::MIN;
        let decision = ModeSelector::new(&params, backend()).select(&prices, "lo").unwrap();
        assert_eq!(decision.selected, BiddingMode::QuantityAndPrice);
        assert!(decision.quantity_only_profit.is_some());
        assert!(decision.quantity_and_price_profit.is_some());
    }

    #[test]
    fn test_flat_prices_tie_goes_to_quantity_only() {
        let params = scenario_params();
        let prices = DayAheadPriceSeries::from_prices(&vec![300.0; 96]).unwrap();
        let decision = ModeSelector::new(&params, backend()).select(&prices, "tie").unwrap();
        assert_eq!(decision.selected, BiddingMode::QuantityOnly);
    }

    #[test]
    fn test_point_estimates_without_scenarios() {
        let mut params = scenario_params();
        params.mode_selection.scenario_count = 0;
        params.mode_selection.parallel = false;
        let decision = ModeSelector::new(&params, backend()).select(&two_window_prices(), "pt").unwrap();

        let stats = decision.quantity_only_stats.unwrap();
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(Some(stats.mean), decision.quantity_only_profit);
    }

    #[test]
    fn test_both_candidates_failing_propagates_error() {
        let mut params = scenario_params();
        params.battery.min_soc = 0.5;
        params.battery.max_soc = 0.5;
        params.day_ahead.discharge_obligation_mwh = 5.0;

        let err = ModeSelector::new(&params, backend())
            .select(&two_window_prices(), "fail")
            .unwrap_err();
        assert!(err.is_infeasible());
    }

    #[test]
    fn test_failed_candidate_falls_back_to_survivor() {
        let mut params = scenario_params();
        params.mode_selection.rarr_threshold = f64::MIN;
        let decision = ModeSelector::new(&params, Arc::new(QuotedOffersFail))
            .select(&two_window_prices(), "one")
            .unwrap();

        assert_eq!(decision.selected, BiddingMode::QuantityOnly);
        assert_eq!(decision.result.mode, BiddingMode::QuantityOnly);
        assert!(decision.rarr.is_none());
        assert!(decision.quantity_only_profit.is_some());
        assert!(decision.quantity_and_price_profit.is_none());
        assert!(decision.quantity_and_price_stats.is_none());
        assert!(matches!(
            decision.fallback,
            Some(RunWarning::ModeFallback { failed_mode: BiddingMode::QuantityAndPrice, .. })
        ));
        assert!(decision
            .warnings()
            .iter()
            .any(|w| matches!(w, RunWarning::ModeFallback { .. })));
    }

    #[test]
    fn test_stats_quantiles() {
        let stats = ProfitStats::from_samples((0..=100).map(f64::from).collect());
        assert_eq!(stats.mean, 50.0);
        assert_eq!(stats.p05, 5.0);
        assert_eq!(stats.p95, 95.0);
        assert_eq!(stats.scenarios, 101);
    }
}
