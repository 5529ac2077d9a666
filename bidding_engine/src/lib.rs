pub mod error;
pub mod models;
pub mod series;
pub mod data_loader;
pub mod solver;
pub mod day_ahead;
pub mod bid_table;
pub mod mode_selector;
pub mod price_predictor;
pub mod frequency;
pub mod coordinator;

pub use error::{EngineError, Result, RunWarning};
pub use models::{BatteryParams, BiddingMode, MarketSelection, ParameterSet};
pub use series::{DayAheadPriceSeries, FrequencyHistory, FrequencyObservation};
pub use data_loader::DataLoader;
pub use day_ahead::{DayAheadOptimizer, DayAheadResult};
pub use bid_table::BidTable;
pub use mode_selector::{ModeDecision, ModeSelector};
pub use price_predictor::{FrequencyForecast, PricePredictor};
pub use frequency::{FrequencyOptimizer, FrequencySchedule};
pub use coordinator::{optimize, JointStrategy, MultiMarketCoordinator, OptimizationOutcome, RiskLevel};
