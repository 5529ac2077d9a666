use crate::error::{EngineError, Result, SeriesKind};
use crate::models::{ParameterSet, DAY_AHEAD_PERIODS, FREQUENCY_HOURS, PERIODS_PER_HOUR};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One quarter-hour day-ahead price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayAheadPricePoint {
    /// 1-based period index (1..=96)
    pub period_index: usize,
    pub hour: u32,
    pub minute: u32,
    pub price: f64,
}

/// Validated 96-period day-ahead price curve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayAheadPriceSeries {
    points: Vec<DayAheadPricePoint>,
}

impl DayAheadPriceSeries {
    pub fn try_new(points: Vec<DayAheadPricePoint>) -> Result<Self> {
        if points.len() != DAY_AHEAD_PERIODS {
            return Err(EngineError::validation(
                SeriesKind::DayAheadPrices,
                None,
                format!("expected {} periods, found {}", DAY_AHEAD_PERIODS, points.len()),
            ));
        }

        for (i, point) in points.iter().enumerate() {
            let expected_index = i + 1;
            let expected_hour = (i / PERIODS_PER_HOUR) as u32;
            let expected_minute = ((i % PERIODS_PER_HOUR) * 15) as u32;

            if point.period_index != expected_index {
                return Err(EngineError::validation(
                    SeriesKind::DayAheadPrices,
                    Some(expected_index),
                    format!(
                        "period index {} out of order (expected {})",
                        point.period_index, expected_index
                    ),
                ));
            }
            if point.hour != expected_hour || point.minute != expected_minute {
                return Err(EngineError::validation(
                    SeriesKind::DayAheadPrices,
                    Some(expected_index),
                    format!(
                        "period {} labelled {:02}:{:02}, expected {:02}:{:02}",
                        expected_index, point.hour, point.minute, expected_hour, expected_minute
                    ),
                ));
            }
            if !point.price.is_finite() {
                return Err(EngineError::validation(
                    SeriesKind::DayAheadPrices,
                    Some(expected_index),
                    "price is not a finite number",
                ));
            }
        }

        Ok(Self { points })
    }

    /// Build a series from 96 prices, labelling periods in order
    pub fn from_prices(prices: &[f64]) -> Result<Self> {
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, &price)| DayAheadPricePoint {
                period_index: i + 1,
                hour: (i / PERIODS_PER_HOUR) as u32,
                minute: ((i % PERIODS_PER_HOUR) * 15) as u32,
                price,
            })
            .collect();
        Self::try_new(points)
    }

    pub fn points(&self) -> &[DayAheadPricePoint] {
        &self.points
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    pub fn price(&self, period: usize) -> f64 {
        self.points[period].price
    }

    /// Mean price of the four quarters in each hour
    pub fn hourly_mean_prices(&self) -> Vec<f64> {
        self.points
            .chunks(PERIODS_PER_HOUR)
            .map(|quarters| quarters.iter().map(|p| p.price).sum::<f64>() / quarters.len() as f64)
            .collect()
    }

    pub fn spread(&self) -> f64 {
        let max = self.points.iter().map(|p| p.price).fold(f64::NEG_INFINITY, f64::max);
        let min = self.points.iter().map(|p| p.price).fold(f64::INFINITY, f64::min);
        max - min
    }
}

/// Historical regulation-market observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyObservation {
    pub timestamp: NaiveDateTime,
    /// Regulation mileage demand (MW)
    pub regulation_demand: f64,
    /// Mileage price
    pub regulation_price: f64,
}

/// Chronological regulation demand/price history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrequencyHistory {
    observations: Vec<FrequencyObservation>,
}

impl FrequencyHistory {
    pub fn try_new(observations: Vec<FrequencyObservation>) -> Result<Self> {
        for (i, obs) in observations.iter().enumerate() {
            let row = Some(i + 1);
            if !obs.regulation_demand.is_finite() || obs.regulation_demand < 0.0 {
                return Err(EngineError::validation(
                    SeriesKind::FrequencyHistory,
                    row,
                    format!("regulation demand {} must be finite and >= 0", obs.regulation_demand),
                ));
            }
            if !obs.regulation_price.is_finite() {
                return Err(EngineError::validation(
                    SeriesKind::FrequencyHistory,
                    row,
                    "regulation price is not a finite number",
                ));
            }
            if i > 0 {
                let previous = observations[i - 1].timestamp;
                if obs.timestamp == previous {
                    return Err(EngineError::validation(
                        SeriesKind::FrequencyHistory,
                        row,
                        format!("duplicate timestamp {}", obs.timestamp),
                    ));
                }
                if obs.timestamp < previous {
                    return Err(EngineError::validation(
                        SeriesKind::FrequencyHistory,
                        row,
                        format!("timestamp {} precedes {}", obs.timestamp, previous),
                    ));
                }
            }
        }

        Ok(Self { observations })
    }

    pub fn observations(&self) -> &[FrequencyObservation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<NaiveDateTime> {
        self.observations.last().map(|o| o.timestamp)
    }

    /// Observations strictly before the start of `date`
    pub fn before(&self, date: NaiveDate) -> Self {
        let cutoff = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        Self {
            observations: self
                .observations
                .iter()
                .filter(|o| o.timestamp < cutoff)
                .copied()
                .collect(),
        }
    }

    pub fn mean_price(&self) -> Option<f64> {
        mean(self.observations.iter().map(|o| o.regulation_price))
    }

    pub fn mean_demand(&self) -> Option<f64> {
        mean(self.observations.iter().map(|o| o.regulation_demand))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// The 24 hourly timestamps of a delivery day
pub fn delivery_hours(date: NaiveDate) -> Vec<NaiveDateTime> {
    let start = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    (0..FREQUENCY_HOURS as i64)
        .map(|h| start + Duration::hours(h))
        .collect()
}

const SNAPSHOT_ID_LEN: usize = 16;

/// Leading hex digits of the SHA-256 of `chunks`
fn fingerprint<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(SNAPSHOT_ID_LEN);
    digest
}

/// Fingerprint of the inputs of one run, used to tag errors. Stable across builds and
/// platforms.
pub fn snapshot_id(
    params: &ParameterSet,
    prices: &DayAheadPriceSeries,
    history: Option<&FrequencyHistory>,
) -> String {
    let mut chunks: Vec<Vec<u8>> = vec![serde_json::to_vec(params).unwrap_or_default()];
    chunks.extend(prices.points().iter().map(|p| p.price.to_le_bytes().to_vec()));
    if let Some(history) = history {
        for obs in history.observations() {
            chunks.push(obs.timestamp.to_string().into_bytes());
            chunks.push(obs.regulation_demand.to_le_bytes().to_vec());
            chunks.push(obs.regulation_price.to_le_bytes().to_vec());
        }
    }
    fingerprint(chunks.iter().map(Vec::as_slice))
}
