use crate::error::{EngineError, Result, SeriesKind};
use crate::series::{DayAheadPricePoint, DayAheadPriceSeries, FrequencyHistory, FrequencyObservation};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Deserialize)]
struct FrequencyRow {
    timestamp: String,
    date: Option<String>,
    hour: Option<u32>,
    regulation_demand: f64,
    regulation_price: f64,
}

/// Reads the CSV files the engine consumes into validated series
pub struct DataLoader;

impl DataLoader {
    /// Load a day-ahead price file with columns `period_index,hour,minute,price`
    pub fn load_day_ahead_prices(path: &Path) -> Result<DayAheadPriceSeries> {
        let file = std::fs::File::open(path)?;
        Self::read_day_ahead_prices(file)
    }

    pub fn read_day_ahead_prices<R: Read>(reader: R) -> Result<DayAheadPriceSeries> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut points = Vec::new();

        for (i, row) in rdr.deserialize::<DayAheadPricePoint>().enumerate() {
            let point = row.map_err(|e| {
                EngineError::validation(SeriesKind::DayAheadPrices, Some(i + 1), e.to_string())
            })?;
            points.push(point);
        }

        DayAheadPriceSeries::try_new(points)
    }

    /// Load a regulation history file with columns
    /// `timestamp,date,hour,regulation_demand,regulation_price`
    pub fn load_frequency_history(path: &Path) -> Result<FrequencyHistory> {
        let file = std::fs::File::open(path)?;
        Self::read_frequency_history(file)
    }

    pub fn read_frequency_history<R: Read>(reader: R) -> Result<FrequencyHistory> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut observations = Vec::new();

        for (i, row) in rdr.deserialize::<FrequencyRow>().enumerate() {
            let line = Some(i + 1);
            let row = row.map_err(|e| {
                EngineError::validation(SeriesKind::FrequencyHistory, line, e.to_string())
            })?;

            let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
                EngineError::validation(
                    SeriesKind::FrequencyHistory,
                    line,
                    format!("unparseable timestamp '{}'", row.timestamp),
                )
            })?;

            if let Some(date) = row.date.as_deref().filter(|d| !d.is_empty()) {
                let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
                    EngineError::validation(
                        SeriesKind::FrequencyHistory,
                        line,
                        format!("bad date '{}': {}", date, e),
                    )
                })?;
                if parsed != timestamp.date() {
                    return Err(EngineError::validation(
                        SeriesKind::FrequencyHistory,
                        line,
                        format!("date {} disagrees with timestamp {}", parsed, timestamp),
                    ));
                }
            }
            if let Some(hour) = row.hour {
                if hour != timestamp.hour() {
                    return Err(EngineError::validation(
                        SeriesKind::FrequencyHistory,
                        line,
                        format!("hour {} disagrees with timestamp {}", hour, timestamp),
                    ));
                }
            }

            observations.push(FrequencyObservation {
                timestamp,
                regulation_demand: row.regulation_demand,
                regulation_price: row.regulation_price,
            });
        }

        FrequencyHistory::try_new(observations)
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}
