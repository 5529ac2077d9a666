use anyhow::Result;
use bidding_engine::{
    DataLoader, FrequencyHistory, MarketSelection, MultiMarketCoordinator, OptimizationOutcome, ParameterSet,
};
use chrono::NaiveDate;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};

/// One day-ahead price file found in the backtest directory
#[derive(Debug, Clone)]
pub struct DayFile {
    pub date: NaiveDate,
    pub path: PathBuf,
}

/// Per-day result row of a backtest
#[derive(Debug, Clone)]
pub struct DayOutcome {
    pub date: NaiveDate,
    pub selected_mode: Option<String>,
    pub rarr: Option<f64>,
    pub day_ahead_profit: f64,
    pub frequency_profit: f64,
    pub total_profit: f64,
    pub day_ahead_cycles: f64,
    pub total_cycles: f64,
    pub risk: Option<String>,
    pub warnings: usize,
    pub error: Option<String>,
}

impl DayOutcome {
    fn failed(date: NaiveDate, error: String) -> Self {
        Self {
            date,
            selected_mode: None,
            rarr: None,
            day_ahead_profit: 0.0,
            frequency_profit: 0.0,
            total_profit: 0.0,
            day_ahead_cycles: 0.0,
            total_cycles: 0.0,
            risk: None,
            warnings: 0,
            error: Some(error),
        }
    }

    fn from_outcome(date: NaiveDate, outcome: &OptimizationOutcome) -> Self {
        let decision = outcome.decision();
        let day_ahead_profit = decision.result.profit.net_profit;
        let (frequency_profit, total_cycles, risk) = match outcome {
            OptimizationOutcome::DayAheadOnly(_) => (0.0, decision.result.cycles, None),
            OptimizationOutcome::Joint(joint) => (
                joint.kpis.frequency_profit,
                joint.kpis.total_cycles,
                Some(format!("{:?}", joint.kpis.risk).to_lowercase()),
            ),
        };

        Self {
            date,
            selected_mode: Some(decision.selected.to_string()),
            rarr: decision.rarr,
            day_ahead_profit,
            frequency_profit,
            total_profit: outcome.total_profit(),
            day_ahead_cycles: decision.result.cycles,
            total_cycles,
            risk,
            warnings: outcome.warnings().len(),
            error: None,
        }
    }
}

/// Find `da_prices_YYYYMMDD.csv` files, sorted by delivery date
pub fn discover_price_files(dir: &Path) -> Result<Vec<DayFile>> {
    let re = Regex::new(r"^da_prices_(\d{8})\.csv$")?;
    let pattern = dir.join("da_prices_*.csv");

    let mut files: Vec<DayFile> = glob(&pattern.to_string_lossy())?
        .filter_map(std::result::Result::ok)
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let digits = re.captures(name)?.get(1)?.as_str().to_string();
            let date = NaiveDate::parse_from_str(&digits, "%Y%m%d").ok()?;
            Some(DayFile { date, path })
        })
        .collect();

    files.sort_by_key(|f| f.date);
    Ok(files)
}

/// Replays the coordinator over a directory of daily price files
pub struct BacktestRunner {
    params: ParameterSet,
    history: Option<FrequencyHistory>,
}

impl BacktestRunner {
    pub fn new(params: ParameterSet, history: Option<FrequencyHistory>) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, history })
    }

    fn selection(&self) -> MarketSelection {
        if self.history.is_some() {
            MarketSelection::MultiMarket
        } else {
            MarketSelection::SingleMarket
        }
    }

    pub fn run_day(&self, day: &DayFile) -> DayOutcome {
        match self.try_run_day(day) {
            Ok(outcome) => DayOutcome::from_outcome(day.date, &outcome),
            Err(e) => {
                log::warn!("{}: {}", day.path.display(), e);
                DayOutcome::failed(day.date, e.to_string())
            }
        }
    }

    fn try_run_day(&self, day: &DayFile) -> Result<OptimizationOutcome> {
        let prices = DataLoader::load_day_ahead_prices(&day.path)?;
        // Only history that was known before delivery may feed the forecast
        let history = self.history.as_ref().map(|h| h.before(day.date));

        let coordinator = MultiMarketCoordinator::new(self.params.clone())?.with_delivery_date(day.date);
        Ok(coordinator.optimize(&prices, self.selection(), history.as_ref())?)
    }

    pub fn run(&self, days: &[DayFile]) -> Vec<DayOutcome> {
        println!("\n📅 Backtesting {} days ({:?})", days.len(), self.selection());

        let pb = ProgressBar::new(days.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut outcomes: Vec<DayOutcome> = days
            .par_iter()
            .map(|day| {
                let outcome = self.run_day(day);
                pb.inc(1);
                outcome
            })
            .collect();

        pb.finish_with_message("Backtest complete");
        outcomes.sort_by_key(|o| o.date);

        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        if failed > 0 {
            println!("  ⚠️  {} of {} days failed", failed, outcomes.len());
        }
        outcomes
    }
}
