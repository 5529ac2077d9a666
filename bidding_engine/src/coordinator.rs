use crate::day_ahead::HourlyDispatch;
use crate::error::{Result, RunWarning, Stage};
use crate::frequency::{FrequencyOptimizer, FrequencySchedule, HourStatus};
use crate::mode_selector::{ModeDecision, ModeSelector};
use crate::models::{BiddingMode, MarketSelection, ParameterSet, PERIODS_PER_HOUR};
use crate::price_predictor::{FrequencyForecast, PriceForecaster, PricePredictor};
use crate::series::{snapshot_id, DayAheadPriceSeries, FrequencyHistory};
use crate::solver::{backend_for, SolverBackend};
use chrono::NaiveDate;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

/// Relative forecast MAE above which forecast risk counts once, and twice
const MAE_RISK_BANDS: (f64, f64) = (0.15, 0.30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct JointPeriodRecord {
    pub period_index: usize,
    pub hour: u32,
    pub minute: u32,
    pub price: f64,
    pub charge_mw: f64,
    pub discharge_mw: f64,
    pub energy_mwh: f64,
    pub soc: f64,
    /// Regulation capacity reserved in the containing hour
    pub reserved_regulation_mw: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JointHourRecord {
    pub hour: usize,
    pub day_ahead_price: f64,
    pub mean_charge_mw: f64,
    pub mean_discharge_mw: f64,
    pub max_abs_net_mw: f64,
    pub regulation_capacity_mw: f64,
    pub regulation_status: HourStatus,
    pub mileage_price_forecast: f64,
    pub regulation_demand_forecast: f64,
    pub frequency_profit: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JointKpis {
    pub selected_mode: BiddingMode,
    pub rarr: Option<f64>,
    pub total_profit: f64,
    /// The selected day-ahead mode's profit on its own
    pub baseline_profit: f64,
    pub frequency_profit: f64,
    pub incremental_revenue: f64,
    /// `None` when the baseline is zero
    pub uplift_pct: Option<f64>,
    pub day_ahead_cycles: f64,
    pub regulation_cycles: f64,
    pub total_cycles: f64,
    /// Day-ahead grid-side charge plus discharge energy and regulation throughput
    pub energy_throughput_mwh: f64,
    /// Total profit over energy throughput; 0 when nothing moved
    pub profit_per_mwh: f64,
    /// Reserved regulation MWh over rated power across the day
    pub capacity_utilisation: f64,
    pub frequency_revenue_share: f64,
    pub forecast_model: &'static str,
    pub forecast_mae: Option<f64>,
    pub forecast_r_squared: Option<f64>,
    pub risk: RiskLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct JointStrategy {
    pub snapshot_id: String,
    pub decision: ModeDecision,
    pub forecast: FrequencyForecast,
    pub frequency: FrequencySchedule,
    pub periods: Vec<JointPeriodRecord>,
    pub hours: Vec<JointHourRecord>,
    pub kpis: JointKpis,
    pub warnings: Vec<RunWarning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "market", rename_all = "snake_case")]
pub enum OptimizationOutcome {
    DayAheadOnly(ModeDecision),
    Joint(Box<JointStrategy>),
}

impl OptimizationOutcome {
    pub fn decision(&self) -> &ModeDecision {
        match self {
            OptimizationOutcome::DayAheadOnly(decision) => decision,
            OptimizationOutcome::Joint(joint) => &joint.decision,
        }
    }

    pub fn total_profit(&self) -> f64 {
        match self {
            OptimizationOutcome::DayAheadOnly(decision) => decision.result.profit.net_profit,
            OptimizationOutcome::Joint(joint) => joint.kpis.total_profit,
        }
    }

    pub fn warnings(&self) -> Vec<RunWarning> {
        match self {
            OptimizationOutcome::DayAheadOnly(decision) => decision.warnings(),
            OptimizationOutcome::Joint(joint) => joint.warnings.clone(),
        }
    }
}

/// Score the qualitative risk of a joint plan
pub fn risk_level(decision: &ModeDecision, forecast: &FrequencyForecast) -> RiskLevel {
    let mut score = 0;
    if decision.selected == BiddingMode::QuantityAndPrice {
        score += 1;
    }
    if decision.fallback.is_some() {
        score += 1;
    }
    if forecast.degraded {
        score += 1;
    }
    if let Some(relative) = forecast.relative_mae {
        if relative > MAE_RISK_BANDS.0 {
            score += 1;
        }
        if relative > MAE_RISK_BANDS.1 {
            score += 1;
        }
    }
    match score {
        0 => RiskLevel::Low,
        1 | 2 => RiskLevel::Moderate,
        _ => RiskLevel::High,
    }
}

/// Runs mode selection, forecasting and the frequency stage for one delivery day
pub struct MultiMarketCoordinator {
    params: ParameterSet,
    predictor: PricePredictor,
    backend: Arc<dyn SolverBackend>,
    delivery_date: Option<NaiveDate>,
}

impl MultiMarketCoordinator {
    pub fn new(params: ParameterSet) -> Result<Self> {
        params.validate()?;
        let predictor = PricePredictor::standard(params.forecast.clone());
        let backend = backend_for(params.solver.backend);
        Ok(Self {
            params,
            predictor,
            backend,
            delivery_date: None,
        })
    }

    pub fn with_forecaster(mut self, forecaster: Box<dyn PriceForecaster>) -> Self {
        self.predictor = PricePredictor::new(self.params.forecast.clone(), vec![forecaster]);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_delivery_date(mut self, date: NaiveDate) -> Self {
        self.delivery_date = Some(date);
        self
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn optimize(
        &self,
        prices: &DayAheadPriceSeries,
        selection: MarketSelection,
        history: Option<&FrequencyHistory>,
    ) -> Result<OptimizationOutcome> {
        let snapshot = snapshot_id(&self.params, prices, history);
        info!("Run {} ({:?})", snapshot, selection);

        let decision = ModeSelector::new(&self.params, Arc::clone(&self.backend)).select(prices, &snapshot)?;
        if selection == MarketSelection::SingleMarket {
            return Ok(OptimizationOutcome::DayAheadOnly(decision));
        }

        let empty = FrequencyHistory::default();
        let forecast = self
            .predictor
            .forecast(history.unwrap_or(&empty), self.delivery_date);

        let hourly = decision.result.hourly_profile(&self.params.battery);
        let mut warnings = decision.warnings();
        warnings.extend(forecast.warnings.iter().cloned());

        let frequency = match FrequencyOptimizer::new(&self.params, Arc::clone(&self.backend))
            .optimize(&forecast, &hourly, &snapshot)
        {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!("{}: {}; continuing with day-ahead only", Stage::Frequency, err);
                warnings.push(RunWarning::FrequencyStageDegraded {
                    reason: err.to_string(),
                });
                FrequencySchedule::idle(Some(&forecast))
            }
        };

        let joint = self.merge(snapshot, decision, forecast, frequency, &hourly, warnings);
        Ok(OptimizationOutcome::Joint(Box::new(joint)))
    }

    fn merge(
        &self,
        snapshot_id: String,
        decision: ModeDecision,
        forecast: FrequencyForecast,
        frequency: FrequencySchedule,
        hourly: &[HourlyDispatch],
        warnings: Vec<RunWarning>,
    ) -> JointStrategy {
        let capacities = frequency.capacities();

        let periods = decision
            .result
            .schedule
            .iter()
            .enumerate()
            .map(|(t, p)| JointPeriodRecord {
                period_index: p.period_index,
                hour: p.hour,
                minute: p.minute,
                price: p.price,
                charge_mw: p.charge_mw,
                discharge_mw: p.discharge_mw,
                energy_mwh: p.energy_mwh,
                soc: p.soc,
                reserved_regulation_mw: capacities.get(t / PERIODS_PER_HOUR).copied().unwrap_or_default(),
            })
            .collect();

        let hours = hourly
            .iter()
            .zip(&frequency.hours)
            .map(|(da, reg)| JointHourRecord {
                hour: da.hour,
                day_ahead_price: da.mean_price,
                mean_charge_mw: da.mean_charge_mw,
                mean_discharge_mw: da.mean_discharge_mw,
                max_abs_net_mw: da.max_abs_net_mw,
                regulation_capacity_mw: reg.capacity_mw,
                regulation_status: reg.status,
                mileage_price_forecast: reg.mileage_price,
                regulation_demand_forecast: reg.regulation_demand,
                frequency_profit: reg.net_profit,
            })
            .collect();

        let kpis = self.kpis(&decision, &forecast, &frequency);
        info!(
            "Joint profit {:.2} = baseline {:.2} + regulation {:.2} (risk {:?})",
            kpis.total_profit, kpis.baseline_profit, kpis.frequency_profit, kpis.risk
        );

        JointStrategy {
            snapshot_id,
            decision,
            forecast,
            frequency,
            periods,
            hours,
            kpis,
            warnings,
        }
    }

    fn kpis(&self, decision: &ModeDecision, forecast: &FrequencyForecast, frequency: &FrequencySchedule) -> JointKpis {
        let baseline_profit = decision.result.profit.net_profit;
        let frequency_profit = frequency.total_profit();
        let total_profit = baseline_profit + frequency_profit;
        let incremental_revenue = total_profit - baseline_profit;
        let uplift_pct = (baseline_profit != 0.0).then(|| incremental_revenue / baseline_profit.abs() * 100.0);

        let day_ahead_cycles = decision.result.cycles;
        let regulation_cycles = frequency.regulation_cycles(&self.params);
        let energy_throughput_mwh =
            decision.result.profit.throughput_mwh + frequency.regulation_throughput_mwh(&self.params);
        let profit_per_mwh = if energy_throughput_mwh > 0.0 {
            total_profit / energy_throughput_mwh
        } else {
            0.0
        };

        let rated = self.params.battery.rated_power_mw;
        let capacity_utilisation = frequency.summary.total_capacity_mwh / (rated * frequency.hours.len().max(1) as f64);

        let frequency_revenue = frequency.total_revenue();
        let gross = frequency_revenue + decision.result.profit.discharge_revenue;
        let frequency_revenue_share = if gross > 0.0 { frequency_revenue / gross } else { 0.0 };

        JointKpis {
            selected_mode: decision.selected,
            rarr: decision.rarr,
            total_profit,
            baseline_profit,
            frequency_profit,
            incremental_revenue,
            uplift_pct,
            day_ahead_cycles,
            regulation_cycles,
            total_cycles: day_ahead_cycles + regulation_cycles,
            energy_throughput_mwh,
            profit_per_mwh,
            capacity_utilisation,
            frequency_revenue_share,
            forecast_model: forecast.model,
            forecast_mae: forecast.mae,
            forecast_r_squared: forecast.r_squared,
            risk: risk_level(decision, forecast),
        }
    }
}

/// Single entry point: day-ahead result for single-market runs, joint strategy otherwise
pub fn optimize(
    params: &ParameterSet,
    day_ahead_prices: &DayAheadPriceSeries,
    selection: MarketSelection,
    frequency_history: Option<&FrequencyHistory>,
) -> Result<OptimizationOutcome> {
    MultiMarketCoordinator::new(params.clone())?.optimize(day_ahead_prices, selection, frequency_history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::day_ahead::tests::{scenario_params, two_window_prices};
    use crate::error::EngineError;
    use crate::price_predictor::tests::synthetic_history;
    use crate::price_predictor::SeasonalProfileForecaster;
    use crate::solver::{LinearProgram, LpSolution, SolveError};

    #[test]
    fn test_single_market_returns_day_ahead_only() {
        let outcome = optimize(&scenario_params(), &two_window_prices(), MarketSelection::SingleMarket, None).unwrap();
        assert!(matches!(outcome, OptimizationOutcome::DayAheadOnly(_)));
        assert!(outcome.total_profit() > 0.0);
    }

    #[test]
    fn test_joint_incremental_revenue_is_exact() {
        let history = synthetic_history(24 * 7);
        let outcome = optimize(
            &scenario_params(),
            &two_window_prices(),
            MarketSelection::MultiMarket,
            Some(&history),
        )
        .unwrap();

        let OptimizationOutcome::Joint(joint) = outcome else {
            panic!("expected joint strategy");
        };
        let k = &joint.kpis;
        assert_eq!(k.incremental_revenue, k.total_profit - k.baseline_profit);
        assert_eq!(k.baseline_profit, joint.decision.result.profit.net_profit);
        assert!(k.frequency_profit >= 0.0);
        assert!(k.total_profit >= k.baseline_profit);
        assert_eq!(joint.periods.len(), 96);
        assert_eq!(joint.hours.len(), 24);
        assert!((k.total_cycles - k.day_ahead_cycles - k.regulation_cycles).abs() < 1e-12);

        let params = scenario_params();
        let regulation = joint.frequency.regulation_throughput_mwh(&params);
        let day_ahead = joint.decision.result.charged_mwh() + joint.decision.result.discharged_mwh();
        assert!((k.energy_throughput_mwh - day_ahead - regulation).abs() < 1e-9);
        assert!(k.energy_throughput_mwh > 0.0);
        assert!((k.profit_per_mwh * k.energy_throughput_mwh - k.total_profit).abs() < 1e-6);
        assert_eq!(k.forecast_model, joint.forecast.model);
        assert_eq!(k.forecast_r_squared, joint.forecast.r_squared);
    }

    #[test]
    fn test_custom_forecaster_replaces_candidates() {
        let coordinator = MultiMarketCoordinator::new(scenario_params())
            .unwrap()
            .with_forecaster(Box::new(SeasonalProfileForecaster));
        let outcome = coordinator
            .optimize(&two_window_prices(), MarketSelection::MultiMarket, Some(&synthetic_history(24 * 7)))
            .unwrap();

        let OptimizationOutcome::Joint(joint) = outcome else {
            panic!("expected joint strategy");
        };
        assert_eq!(joint.kpis.forecast_model, "seasonal_profile");
        assert_eq!(joint.forecast.candidates.len(), 1);
    }

    #[test]
    fn test_regulation_reserve_does_not_touch_energy_ledger() {
        let history = synthetic_history(24 * 7);
        let params = scenario_params();
        let single = optimize(&params, &two_window_prices(), MarketSelection::SingleMarket, Some(&history)).unwrap();
        let joint = optimize(&params, &two_window_prices(), MarketSelection::MultiMarket, Some(&history)).unwrap();

        let OptimizationOutcome::Joint(joint) = joint else {
            panic!("expected joint strategy");
        };
        for (a, b) in single.decision().result.schedule.iter().zip(&joint.periods) {
            assert_eq!(a.energy_mwh, b.energy_mwh);
        }
        for (t, period) in joint.periods.iter().enumerate() {
            assert_eq!(period.reserved_regulation_mw, joint.frequency.hours[t / 4].capacity_mw);
        }
    }

    #[test]
    fn test_short_history_marks_forecast_degraded() {
        let outcome = optimize(
            &scenario_params(),
            &two_window_prices(),
            MarketSelection::MultiMarket,
            Some(&synthetic_history(5)),
        )
        .unwrap();

        let OptimizationOutcome::Joint(joint) = outcome else {
            panic!("expected joint strategy");
        };
        assert!(joint.forecast.degraded);
        assert!(joint
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::ForecastDegraded { observations: 5, .. })));
        assert_ne!(joint.kpis.risk, RiskLevel::Low);
    }

    /// Solves day-ahead models normally but fails every 24-variable regulation model
    struct FrequencyBreaker;

    impl SolverBackend for FrequencyBreaker {
        fn name(&self) -> &'static str {
            "breaker"
        }
        fn supports_integers(&self) -> bool {
            true
        }
        fn solve(&self, program: &LinearProgram) -> std::result::Result<LpSolution, SolveError> {
            if program.vars.len() == 24 {
                Err(SolveError::Numerical("forced".to_string()))
            } else {
                crate::solver::MicroLpBackend.solve(program)
            }
        }
    }

    #[test]
    fn test_frequency_failure_degrades_to_day_ahead_profit() {
        let coordinator = MultiMarketCoordinator::new(scenario_params())
            .unwrap()
            .with_backend(Arc::new(FrequencyBreaker));
        let outcome = coordinator
            .optimize(&two_window_prices(), MarketSelection::MultiMarket, Some(&synthetic_history(72)))
            .unwrap();

        let OptimizationOutcome::Joint(joint) = outcome else {
            panic!("expected joint strategy");
        };
        assert_eq!(joint.kpis.frequency_profit, 0.0);
        assert_eq!(joint.kpis.total_profit, joint.kpis.baseline_profit);
        assert!(joint
            .warnings
            .iter()
            .any(|w| matches!(w, RunWarning::FrequencyStageDegraded { .. })));
    }

    #[test]
    fn test_invalid_parameters_rejected_before_solving() {
        let mut params = scenario_params();
        params.battery.discharge_efficiency = 1.5;
        let err = optimize(&params, &two_window_prices(), MarketSelection::SingleMarket, None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter { .. }));
    }

    #[test]
    fn test_risk_scoring() {
        let params = scenario_params();
        let decision = ModeSelector::new(&params, backend_for(params.solver.backend))
            .select(&two_window_prices(), "risk")
            .unwrap();
        let predictor = PricePredictor::standard(params.forecast.clone());

        let good = predictor.forecast(&synthetic_history(24 * 7), None);
        let degraded = predictor.forecast(&synthetic_history(3), None);

        let base = risk_level(&decision, &good);
        let worse = risk_level(&decision, &degraded);
        assert!(worse >= base);
        assert_ne!(worse, RiskLevel::Low);
    }
}
