use crate::models::BiddingMode;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stage an error or warning originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parameters,
    DayAhead,
    ModeSelection,
    PricePrediction,
    Frequency,
    Coordination,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parameters => "parameters",
            Stage::DayAhead => "day_ahead",
            Stage::ModeSelection => "mode_selection",
            Stage::PricePrediction => "price_prediction",
            Stage::Frequency => "frequency",
            Stage::Coordination => "coordination",
        };
        f.write_str(name)
    }
}

/// Input series a validation error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    DayAheadPrices,
    FrequencyHistory,
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesKind::DayAheadPrices => f.write_str("day-ahead price series"),
            SeriesKind::FrequencyHistory => f.write_str("frequency history"),
        }
    }
}

/// Families of constraints, used to tag model rows and to explain infeasibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintGroup {
    PowerLimit,
    Complementarity,
    EnergyBalance,
    SocBand,
    Ramp,
    CycleLimit,
    TerminalEnergy,
    DischargeObligation,
    SegmentLink,
    CapacityLimit,
    EconomicFloor,
}

impl fmt::Display for ConstraintGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintGroup::PowerLimit => "power limit",
            ConstraintGroup::Complementarity => "charge/discharge exclusivity",
            ConstraintGroup::EnergyBalance => "energy balance",
            ConstraintGroup::SocBand => "SOC band",
            ConstraintGroup::Ramp => "ramp limit",
            ConstraintGroup::CycleLimit => "cycle limit",
            ConstraintGroup::TerminalEnergy => "terminal energy",
            ConstraintGroup::DischargeObligation => "discharge obligation",
            ConstraintGroup::SegmentLink => "bid segment link",
            ConstraintGroup::CapacityLimit => "regulation capacity limit",
            ConstraintGroup::EconomicFloor => "economic floor",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintViolation {
    pub group: ConstraintGroup,
    pub detail: String,
}

/// Where a failure happened and which inputs produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    pub stage: Stage,
    pub mode: Option<BiddingMode>,
    pub snapshot_id: String,
}

impl ErrorContext {
    pub fn new(stage: Stage, snapshot_id: impl Into<String>) -> Self {
        Self {
            stage,
            mode: None,
            snapshot_id: snapshot_id.into(),
        }
    }

    pub fn with_mode(mut self, mode: BiddingMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.stage)?;
        if let Some(mode) = self.mode {
            write!(f, "/{}", mode)?;
        }
        write!(f, " snapshot {}]", self.snapshot_id)
    }
}

fn describe_violations(violations: &[ConstraintViolation]) -> String {
    if violations.is_empty() {
        return "no single relaxable constraint explains it".to_string();
    }
    violations
        .iter()
        .map(|v| format!("{}: {}", v.group, v.detail))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid {series} (row {row:?}): {reason}")]
    DataValidation {
        series: SeriesKind,
        row: Option<usize>,
        reason: String,
    },

    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("{context} infeasible: {}", describe_violations(.violations))]
    Infeasible {
        context: ErrorContext,
        violations: Vec<ConstraintViolation>,
    },

    #[error("{context} solver failure after {attempts} attempt(s): {reason}")]
    SolverFailure {
        context: ErrorContext,
        attempts: u32,
        reason: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(series: SeriesKind, row: Option<usize>, reason: impl Into<String>) -> Self {
        EngineError::DataValidation {
            series,
            row,
            reason: reason.into(),
        }
    }

    pub fn parameter(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }

    pub fn is_infeasible(&self) -> bool {
        matches!(self, EngineError::Infeasible { .. })
    }

    pub fn violations(&self) -> &[ConstraintViolation] {
        match self {
            EngineError::Infeasible { violations, .. } => violations,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Non-fatal conditions recorded alongside a result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    ForecastDegraded { observations: usize, required: usize },
    ModeFallback { failed_mode: BiddingMode, reason: String },
    FrequencyStageDegraded { reason: String },
    ComplementarityFallback { periods: Vec<usize> },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::ForecastDegraded {
                observations,
                required,
            } => write!(
                f,
                "forecast degraded to historical mean ({} observations, {} required)",
                observations, required
            ),
            RunWarning::ModeFallback {
                failed_mode,
                reason,
            } => write!(f, "{} candidate dropped: {}", failed_mode, reason),
            RunWarning::FrequencyStageDegraded { reason } => {
                write!(f, "frequency stage skipped: {}", reason)
            }
            RunWarning::ComplementarityFallback { periods } => write!(
                f,
                "surrogate allowed simultaneous charge/discharge in {} period(s); re-solved with binaries",
                periods.len()
            ),
        }
    }
}
