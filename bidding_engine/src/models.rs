use crate::error::{EngineError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DAY_AHEAD_PERIODS: usize = 96;
pub const FREQUENCY_HOURS: usize = 24;
pub const PERIODS_PER_HOUR: usize = 4;
pub const DAY_AHEAD_STEP_MINUTES: u32 = 15;
pub const FREQUENCY_STEP_MINUTES: u32 = 60;
/// Longest wall-clock budget a single solve attempt, retry included, may be given
pub const MAX_SOLVER_BUDGET_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiddingMode {
    QuantityOnly,
    QuantityAndPrice,
}

impl BiddingMode {
    pub fn all() -> [BiddingMode; 2] {
        [BiddingMode::QuantityOnly, BiddingMode::QuantityAndPrice]
    }
}

impl fmt::Display for BiddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BiddingMode::QuantityOnly => f.write_str("quantity_only"),
            BiddingMode::QuantityAndPrice => f.write_str("quantity_and_price"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSelection {
    SingleMarket,
    MultiMarket,
}

/// How exclusive charge/discharge is enforced in the day-ahead model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complementarity {
    /// `c + d <= P`, re-solved with binaries if the LP still mixes directions
    Surrogate,
    /// One binary direction indicator per period
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    MicroLp,
    Clarabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryParams {
    pub energy_capacity_mwh: f64,
    pub rated_power_mw: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
    pub min_soc: f64,
    pub max_soc: f64,
    pub initial_soc: f64,
    /// MW of net-power change allowed between consecutive 15-minute periods
    pub ramp_limit_mw: f64,
    /// Equivalent full cycles allowed over the day-ahead horizon
    pub max_cycles: f64,
    pub degradation_cost_per_cycle: f64,
    pub daily_om_cost: f64,
}

impl Default for BatteryParams {
    fn default() -> Self {
        Self {
            energy_capacity_mwh: 50.0,
            rated_power_mw: 10.0,
            charge_efficiency: 0.9,
            discharge_efficiency: 0.9,
            min_soc: 0.2,
            max_soc: 0.8,
            initial_soc: 0.5,
            ramp_limit_mw: 2.0,
            max_cycles: 1.0,
            degradation_cost_per_cycle: 5.0,
            daily_om_cost: 1000.0,
        }
    }
}

impl BatteryParams {
    pub fn min_energy_mwh(&self) -> f64 {
        self.min_soc * self.energy_capacity_mwh
    }

    pub fn max_energy_mwh(&self) -> f64 {
        self.max_soc * self.energy_capacity_mwh
    }

    pub fn initial_energy_mwh(&self) -> f64 {
        self.initial_soc * self.energy_capacity_mwh
    }

    pub fn round_trip_efficiency(&self) -> f64 {
        self.charge_efficiency * self.discharge_efficiency
    }

    /// Cost of one MWh of battery-side throughput
    pub fn degradation_cost_per_mwh(&self) -> f64 {
        self.degradation_cost_per_cycle / (2.0 * self.energy_capacity_mwh)
    }
}

/// One step of a quantity-and-price offer curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BidSegment {
    /// Fraction of rated power this segment may offer
    pub share: f64,
    /// Relative distance of the limit price from forecast, on the less aggressive side
    /// when positive: sales ask `forecast + markup * |forecast|`
    pub markup: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DayAheadSettings {
    pub step_minutes: u32,
    /// `None` leaves the end-of-day state free
    pub terminal_soc: Option<f64>,
    /// Penalty per MWh of terminal deviation; `None` makes the target a hard equality
    pub terminal_soc_penalty: Option<f64>,
    /// Energy that must be delivered over the day (MWh)
    pub discharge_obligation_mwh: f64,
    pub complementarity: Complementarity,
    /// Largest relative markup/markdown allowed on a price bid
    pub price_band: f64,
    /// Relative standard deviation of day-ahead price forecast error
    pub price_error_std: f64,
    pub segments: Vec<BidSegment>,
}

impl Default for DayAheadSettings {
    fn default() -> Self {
        Self {
            step_minutes: DAY_AHEAD_STEP_MINUTES,
            terminal_soc: Some(0.5),
            terminal_soc_penalty: None,
            discharge_obligation_mwh: 0.0,
            complementarity: Complementarity::Surrogate,
            price_band: 0.15,
            price_error_std: 0.15,
            segments: vec![
                BidSegment {
                    share: 0.5,
                    markup: -0.05,
                },
                BidSegment {
                    share: 0.4,
                    markup: 0.05,
                },
                BidSegment {
                    share: 0.1,
                    markup: 0.15,
                },
            ],
        }
    }
}

impl DayAheadSettings {
    pub fn step_hours(&self) -> f64 {
        f64::from(self.step_minutes) / 60.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyTariff {
    pub step_minutes: u32,
    /// Capacity compensation per MW per hour
    pub approved_cost_rate: f64,
    /// Share of the mileage price paid per MW of capacity
    pub mileage_compensation_rate: f64,
    /// Measured performance factor applied to mileage compensation
    pub measured_adjustment_rate: f64,
    /// MWh of regulation throughput per MW of capacity per hour
    pub regulation_activity_coefficient: f64,
    pub om_cost_rate: f64,
    /// Fraction of rated power kept out of the regulation offer
    pub power_safety_margin: f64,
    pub max_capacity_mw: Option<f64>,
    /// Hours that cannot earn more than this are not offered
    pub min_hourly_profit: f64,
}

impl Default for FrequencyTariff {
    fn default() -> Self {
        Self {
            step_minutes: FREQUENCY_STEP_MINUTES,
            approved_cost_rate: 40.0,
            mileage_compensation_rate: 0.1,
            measured_adjustment_rate: 0.85,
            regulation_activity_coefficient: 0.15,
            om_cost_rate: 0.3,
            power_safety_margin: 0.05,
            max_capacity_mw: None,
            min_hourly_profit: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeSelectionSettings {
    pub scenario_count: usize,
    pub seed: u64,
    pub rarr_threshold: f64,
    pub epsilon: f64,
    /// Solve both candidate modes concurrently
    pub parallel: bool,
}

impl Default for ModeSelectionSettings {
    fn default() -> Self {
        Self {
            scenario_count: 1000,
            seed: 42,
            rarr_threshold: 0.0,
            epsilon: 1e-9,
            parallel: true,
        }
    }
}

/// Candidate regulation-price models, compared on held-out error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastModel {
    RidgeRegression,
    SeasonalProfile,
    HistoricalMean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    /// Models fitted and scored each run; the lowest MAE wins, earlier entries win ties
    pub models: Vec<ForecastModel>,
    pub min_history_hours: usize,
    pub holdout_hours: usize,
    pub price_upper_limit: f64,
    pub price_min_unit: f64,
    pub fallback_mileage_price: f64,
    pub fallback_regulation_demand: f64,
    pub ridge_lambda: f64,
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            models: vec![
                ForecastModel::RidgeRegression,
                ForecastModel::SeasonalProfile,
                ForecastModel::HistoricalMean,
            ],
            min_history_hours: 24,
            holdout_hours: 24,
            price_upper_limit: 50.0,
            price_min_unit: 0.1,
            fallback_mileage_price: 25.0,
            fallback_regulation_demand: 100.0,
            ridge_lambda: 1e-3,
            peak_start_hour: 8,
            peak_end_hour: 22,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub backend: SolverKind,
    pub time_limit_secs: f64,
    /// Budget multiplier for the single retry after a timeout or numerical failure
    pub retry_budget_factor: f64,
    pub zero_tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            backend: SolverKind::MicroLp,
            time_limit_secs: 30.0,
            retry_budget_factor: 2.0,
            zero_tolerance: 1e-7,
        }
    }
}

/// Immutable configuration shared read-only by every stage of one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    pub battery: BatteryParams,
    pub day_ahead: DayAheadSettings,
    pub tariff: FrequencyTariff,
    pub mode_selection: ModeSelectionSettings,
    pub forecast: ForecastSettings,
    pub solver: SolverSettings,
}

impl ParameterSet {
    /// 100 MWh / 50 MW station tuned for higher utilisation
    pub fn large_station() -> Self {
        let battery = BatteryParams {
            energy_capacity_mwh: 100.0,
            rated_power_mw: 50.0,
            charge_efficiency: 0.92,
            discharge_efficiency: 0.92,
            min_soc: 0.05,
            max_soc: 0.95,
            initial_soc: 0.5,
            ramp_limit_mw: 20.0,
            max_cycles: 3.0,
            degradation_cost_per_cycle: 6.0,
            daily_om_cost: 3000.0,
        };
        let tariff = FrequencyTariff {
            regulation_activity_coefficient: 0.06,
            measured_adjustment_rate: 0.95,
            om_cost_rate: 0.08,
            ..FrequencyTariff::default()
        };
        let forecast = ForecastSettings {
            price_upper_limit: 65.0,
            ..ForecastSettings::default()
        };

        Self {
            battery,
            tariff,
            forecast,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: ParameterSet = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the invariants every optimizer relies on
    pub fn validate(&self) -> Result<()> {
        let b = &self.battery;
        require_positive("battery.energy_capacity_mwh", b.energy_capacity_mwh)?;
        require_positive("battery.rated_power_mw", b.rated_power_mw)?;
        require_fraction_open("battery.charge_efficiency", b.charge_efficiency)?;
        require_fraction_open("battery.discharge_efficiency", b.discharge_efficiency)?;
        require_unit_interval("battery.min_soc", b.min_soc)?;
        require_unit_interval("battery.max_soc", b.max_soc)?;
        require_unit_interval("battery.initial_soc", b.initial_soc)?;
        if b.min_soc > b.max_soc {
            return Err(EngineError::parameter(
                "battery.min_soc",
                format!("min_soc {} exceeds max_soc {}", b.min_soc, b.max_soc),
            ));
        }
        if b.min_soc == b.max_soc {
            warn!(
                "SOC band collapsed to {:.3}; the battery has no energy headroom",
                b.min_soc
            );
        }
        require_positive("battery.ramp_limit_mw", b.ramp_limit_mw)?;
        require_non_negative("battery.max_cycles", b.max_cycles)?;
        require_non_negative("battery.degradation_cost_per_cycle", b.degradation_cost_per_cycle)?;
        require_non_negative("battery.daily_om_cost", b.daily_om_cost)?;

        let da = &self.day_ahead;
        if da.step_minutes != DAY_AHEAD_STEP_MINUTES {
            return Err(EngineError::parameter(
                "day_ahead.step_minutes",
                format!("day-ahead periods are {} minutes", DAY_AHEAD_STEP_MINUTES),
            ));
        }
        if let Some(target) = da.terminal_soc {
            require_unit_interval("day_ahead.terminal_soc", target)?;
        }
        if let Some(weight) = da.terminal_soc_penalty {
            require_non_negative("day_ahead.terminal_soc_penalty", weight)?;
        }
        require_non_negative("day_ahead.discharge_obligation_mwh", da.discharge_obligation_mwh)?;
        require_non_negative("day_ahead.price_band", da.price_band)?;
        require_positive("day_ahead.price_error_std", da.price_error_std)?;
        if da.segments.is_empty() {
            return Err(EngineError::parameter(
                "day_ahead.segments",
                "at least one bid segment is required",
            ));
        }
        let mut share_total = 0.0;
        for segment in &da.segments {
            require_positive("day_ahead.segments.share", segment.share)?;
            if segment.markup.abs() > da.price_band + 1e-12 {
                return Err(EngineError::parameter(
                    "day_ahead.segments.markup",
                    format!(
                        "markup {} lies outside the price band ±{}",
                        segment.markup, da.price_band
                    ),
                ));
            }
            share_total += segment.share;
        }
        if share_total > 1.0 + 1e-9 {
            return Err(EngineError::parameter(
                "day_ahead.segments.share",
                format!("segment shares sum to {:.3} (> 1)", share_total),
            ));
        }

        let t = &self.tariff;
        if t.step_minutes != FREQUENCY_STEP_MINUTES {
            return Err(EngineError::parameter(
                "tariff.step_minutes",
                format!("frequency periods are {} minutes", FREQUENCY_STEP_MINUTES),
            ));
        }
        require_non_negative("tariff.approved_cost_rate", t.approved_cost_rate)?;
        require_non_negative("tariff.mileage_compensation_rate", t.mileage_compensation_rate)?;
        require_non_negative("tariff.measured_adjustment_rate", t.measured_adjustment_rate)?;
        require_non_negative(
            "tariff.regulation_activity_coefficient",
            t.regulation_activity_coefficient,
        )?;
        require_non_negative("tariff.om_cost_rate", t.om_cost_rate)?;
        if !(0.0..1.0).contains(&t.power_safety_margin) {
            return Err(EngineError::parameter(
                "tariff.power_safety_margin",
                "must lie in [0, 1)",
            ));
        }
        if let Some(cap) = t.max_capacity_mw {
            require_non_negative("tariff.max_capacity_mw", cap)?;
        }

        let m = &self.mode_selection;
        require_positive("mode_selection.epsilon", m.epsilon)?;
        if !m.rarr_threshold.is_finite() {
            return Err(EngineError::parameter(
                "mode_selection.rarr_threshold",
                "must be finite",
            ));
        }

        let f = &self.forecast;
        if f.models.is_empty() {
            return Err(EngineError::parameter(
                "forecast.models",
                "at least one forecast model is required",
            ));
        }
        if f.min_history_hours == 0 {
            return Err(EngineError::parameter(
                "forecast.min_history_hours",
                "must be at least 1",
            ));
        }
        require_positive("forecast.price_upper_limit", f.price_upper_limit)?;
        require_positive("forecast.price_min_unit", f.price_min_unit)?;
        require_non_negative("forecast.fallback_mileage_price", f.fallback_mileage_price)?;
        require_non_negative(
            "forecast.fallback_regulation_demand",
            f.fallback_regulation_demand,
        )?;
        require_positive("forecast.ridge_lambda", f.ridge_lambda)?;
        if f.peak_start_hour > 23 || f.peak_end_hour > 23 {
            return Err(EngineError::parameter(
                "forecast.peak_start_hour",
                "peak hours must lie in 0..=23",
            ));
        }

        let s = &self.solver;
        require_positive("solver.time_limit_secs", s.time_limit_secs)?;
        if s.retry_budget_factor.is_nan() || s.retry_budget_factor < 1.0 {
            return Err(EngineError::parameter(
                "solver.retry_budget_factor",
                "must be at least 1",
            ));
        }
        let retry_budget = s.time_limit_secs * s.retry_budget_factor;
        if !retry_budget.is_finite() || retry_budget > MAX_SOLVER_BUDGET_SECS {
            return Err(EngineError::parameter(
                "solver.retry_budget_factor",
                format!(
                    "retry budget of {} s exceeds {} s",
                    retry_budget, MAX_SOLVER_BUDGET_SECS
                ),
            ));
        }
        require_positive("solver.zero_tolerance", s.zero_tolerance)?;

        Ok(())
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(EngineError::parameter(field, format!("must be > 0, got {}", value)))
    }
}

fn require_non_negative(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(EngineError::parameter(field, format!("must be >= 0, got {}", value)))
    }
}

fn require_unit_interval(field: &'static str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(EngineError::parameter(field, format!("must lie in [0, 1], got {}", value)))
    }
}

fn require_fraction_open(field: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(EngineError::parameter(field, format!("must lie in (0, 1], got {}", value)))
    }
}
