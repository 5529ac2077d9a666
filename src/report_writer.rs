use crate::batch_runner::DayOutcome;
use anyhow::Result;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct ReportPaths {
    pub days_csv: PathBuf,
    pub days_parquet: PathBuf,
    pub by_mode_csv: PathBuf,
}

pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    /// Per-day backtest rows as a DataFrame
    pub fn days_frame(outcomes: &[DayOutcome]) -> Result<DataFrame> {
        let dates: Vec<String> = outcomes.iter().map(|o| o.date.format("%Y-%m-%d").to_string()).collect();
        let modes: Vec<Option<String>> = outcomes.iter().map(|o| o.selected_mode.clone()).collect();
        let rarr: Vec<Option<f64>> = outcomes.iter().map(|o| o.rarr).collect();
        let day_ahead: Vec<f64> = outcomes.iter().map(|o| o.day_ahead_profit).collect();
        let frequency: Vec<f64> = outcomes.iter().map(|o| o.frequency_profit).collect();
        let total: Vec<f64> = outcomes.iter().map(|o| o.total_profit).collect();
        let da_cycles: Vec<f64> = outcomes.iter().map(|o| o.day_ahead_cycles).collect();
        let total_cycles: Vec<f64> = outcomes.iter().map(|o| o.total_cycles).collect();
        let risk: Vec<Option<String>> = outcomes.iter().map(|o| o.risk.clone()).collect();
        let warnings: Vec<u32> = outcomes.iter().map(|o| o.warnings as u32).collect();
        let errors: Vec<Option<String>> = outcomes.iter().map(|o| o.error.clone()).collect();

        let df = DataFrame::new(vec![
            Series::new("date", dates),
            Series::new("selected_mode", modes),
            Series::new("rarr", rarr),
            Series::new("day_ahead_profit", day_ahead),
            Series::new("frequency_profit", frequency),
            Series::new("total_profit", total),
            Series::new("day_ahead_cycles", da_cycles),
            Series::new("total_cycles", total_cycles),
            Series::new("risk", risk),
            Series::new("warnings", warnings),
            Series::new("error", errors),
        ])?;
        Ok(df)
    }

    /// Profit and cycle totals per selected mode, failed days excluded
    pub fn by_mode_frame(days: &DataFrame) -> Result<DataFrame> {
        let grouped = days
            .clone()
            .lazy()
            .filter(col("error").is_null())
            .group_by([col("selected_mode")])
            .agg([
                col("date").count().alias("days"),
                col("total_profit").sum().alias("total_profit_sum"),
                col("total_profit").mean().alias("total_profit_mean"),
                col("frequency_profit").sum().alias("frequency_profit_sum"),
                col("total_cycles").mean().alias("total_cycles_mean"),
                col("rarr").mean().alias("rarr_mean"),
            ])
            .sort("selected_mode", Default::default())
            .collect()?;
        Ok(grouped)
    }

    pub fn write(&self, outcomes: &[DayOutcome]) -> Result<ReportPaths> {
        let mut days = Self::days_frame(outcomes)?;
        let mut by_mode = Self::by_mode_frame(&days)?;

        let days_csv = self.output_dir.join("backtest_days.csv");
        println!("  💾 Saving CSV...");
        CsvWriter::new(File::create(&days_csv)?).finish(&mut days)?;

        let days_parquet = self.output_dir.join("backtest_days.parquet");
        println!("  📦 Saving Parquet...");
        ParquetWriter::new(File::create(&days_parquet)?).finish(&mut days)?;

        let by_mode_csv = self.output_dir.join("backtest_by_mode.csv");
        CsvWriter::new(File::create(&by_mode_csv)?).finish(&mut by_mode)?;

        Ok(ReportPaths {
            days_csv,
            days_parquet,
            by_mode_csv,
        })
    }
}
