use crate::error::{RunWarning, Stage};
use crate::models::{ForecastModel, ForecastSettings, FREQUENCY_HOURS};
use crate::series::{delivery_hours, FrequencyHistory, FrequencyObservation};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::f64::consts::PI;

#[derive(Debug, Clone, Serialize)]
pub struct HourlyPrediction {
    pub timestamp: NaiveDateTime,
    pub hour: u32,
    /// Forecast regulation mileage demand (MW)
    pub regulation_demand: f64,
    /// Forecast mileage price
    pub mileage_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrequencyForecast {
    pub predictions: Vec<HourlyPrediction>,
    pub model: &'static str,
    pub degraded: bool,
    pub observations: usize,
    /// Mean absolute error of the price forecast
    pub mae: Option<f64>,
    /// The MAE was measured on the fitting data rather than a held-out tail
    pub mae_in_sample: bool,
    /// MAE relative to mean absolute price
    pub relative_mae: Option<f64>,
    /// Coefficient of determination on the same data as `mae`
    pub r_squared: Option<f64>,
    /// Every candidate that could be fitted, in configured order
    pub candidates: Vec<CandidateScore>,
    pub warnings: Vec<RunWarning>,
}

/// Validation score of one candidate model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub model: &'static str,
    pub mae: f64,
    pub r_squared: Option<f64>,
    pub in_sample: bool,
}

impl FrequencyForecast {
    pub fn mileage_prices(&self) -> Vec<f64> {
        self.predictions.iter().map(|p| p.mileage_price).collect()
    }

    pub fn mean_price(&self) -> f64 {
        if self.predictions.is_empty() {
            return 0.0;
        }
        self.mileage_prices().iter().sum::<f64>() / self.predictions.len() as f64
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("forecast fit failed: {0}")]
pub struct FitError(pub String);

/// Fitting half of the forecasting capability
pub trait PriceForecaster: Send + Sync {
    fn name(&self) -> &'static str;
    fn fit(&self, history: &[FrequencyObservation]) -> Result<Box<dyn FittedForecast>, FitError>;
}

/// Prediction half of the forecasting capability; outputs are raw model values
pub trait FittedForecast: Send + Sync {
    fn predict(&self, hours: &[NaiveDateTime]) -> Vec<HourlyPrediction>;
}

/// Constant historical mean of demand and price
pub struct MeanBaselineForecaster {
    pub fallback_demand: f64,
    pub fallback_price: f64,
}

struct MeanBaseline {
    demand: f64,
    price: f64,
}

impl PriceForecaster for MeanBaselineForecaster {
    fn name(&self) -> &'static str {
        "historical_mean"
    }

    fn fit(&self, history: &[FrequencyObservation]) -> Result<Box<dyn FittedForecast>, FitError> {
        let n = history.len() as f64;
        let (demand, price) = if history.is_empty() {
            (self.fallback_demand, self.fallback_price)
        } else {
            (
                history.iter().map(|o| o.regulation_demand).sum::<f64>() / n,
                history.iter().map(|o| o.regulation_price).sum::<f64>() / n,
            )
        };
        Ok(Box::new(MeanBaseline { demand, price }))
    }
}

impl FittedForecast for MeanBaseline {
    fn predict(&self, hours: &[NaiveDateTime]) -> Vec<HourlyPrediction> {
        hours
            .iter()
            .map(|&timestamp| HourlyPrediction {
                timestamp,
                hour: timestamp.hour(),
                regulation_demand: self.demand,
                mileage_price: self.price,
            })
            .collect()
    }
}

/// Hour-of-day means of demand and price; hours never observed take the overall mean
pub struct SeasonalProfileForecaster;

struct SeasonalProfile {
    demand: [f64; 24],
    price: [f64; 24],
}

impl PriceForecaster for SeasonalProfileForecaster {
    fn name(&self) -> &'static str {
        "seasonal_profile"
    }

    fn fit(&self, history: &[FrequencyObservation]) -> Result<Box<dyn FittedForecast>, FitError> {
        if history.is_empty() {
            return Err(FitError("no observations".to_string()));
        }
        let n = history.len() as f64;
        let mean_demand = history.iter().map(|o| o.regulation_demand).sum::<f64>() / n;
        let mean_price = history.iter().map(|o| o.regulation_price).sum::<f64>() / n;

        let mut sums = [(0.0, 0.0, 0usize); 24];
        for obs in history {
            let slot = &mut sums[obs.timestamp.hour() as usize];
            slot.0 += obs.regulation_demand;
            slot.1 += obs.regulation_price;
            slot.2 += 1;
        }

        let mut demand = [mean_demand; 24];
        let mut price = [mean_price; 24];
        for (hour, &(d, p, count)) in sums.iter().enumerate() {
            if count > 0 {
                demand[hour] = d / count as f64;
                price[hour] = p / count as f64;
            }
        }
        Ok(Box::new(SeasonalProfile { demand, price }))
    }
}

impl FittedForecast for SeasonalProfile {
    fn predict(&self, hours: &[NaiveDateTime]) -> Vec<HourlyPrediction> {
        hours
            .iter()
            .map(|&timestamp| {
                let hour = timestamp.hour();
                HourlyPrediction {
                    timestamp,
                    hour,
                    regulation_demand: self.demand[hour as usize],
                    mileage_price: self.price[hour as usize],
                }
            })
            .collect()
    }
}

/// Ridge least squares on calendar, daily-harmonic and 24h-lag features.
/// Demand is modelled first; the price model also sees the demand.
pub struct RegressionForecaster {
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub ridge_lambda: f64,
}

impl RegressionForecaster {
    pub fn from_settings(settings: &ForecastSettings) -> Self {
        Self {
            peak_start_hour: settings.peak_start_hour,
            peak_end_hour: settings.peak_end_hour,
            ridge_lambda: settings.ridge_lambda,
        }
    }
}

struct RegressionModel {
    peak_start_hour: u32,
    peak_end_hour: u32,
    demand_coefficients: Vec<f64>,
    price_coefficients: Vec<f64>,
    lags: HashMap<NaiveDateTime, (f64, f64)>,
    mean_demand: f64,
    mean_price: f64,
}

fn calendar_features(ts: NaiveDateTime, peak_start: u32, peak_end: u32) -> Vec<f64> {
    let hour = ts.hour();
    let angle = 2.0 * PI * f64::from(hour) / 24.0;
    let peak = if hour >= peak_start && hour <= peak_end { 1.0 } else { 0.0 };
    let weekend = match ts.weekday() {
        Weekday::Sat | Weekday::Sun => 1.0,
        _ => 0.0,
    };
    vec![
        1.0,
        angle.sin(),
        angle.cos(),
        (2.0 * angle).sin(),
        (2.0 * angle).cos(),
        peak,
        weekend,
    ]
}

impl PriceForecaster for RegressionForecaster {
    fn name(&self) -> &'static str {
        "ridge_regression"
    }

    fn fit(&self, history: &[FrequencyObservation]) -> Result<Box<dyn FittedForecast>, FitError> {
        if history.is_empty() {
            return Err(FitError("no observations".to_string()));
        }
        let n = history.len() as f64;
        let mean_demand = history.iter().map(|o| o.regulation_demand).sum::<f64>() / n;
        let mean_price = history.iter().map(|o| o.regulation_price).sum::<f64>() / n;
        let lags: HashMap<NaiveDateTime, (f64, f64)> = history
            .iter()
            .map(|o| (o.timestamp, (o.regulation_demand, o.regulation_price)))
            .collect();

        let mut demand_rows = Vec::with_capacity(history.len());
        let mut price_rows = Vec::with_capacity(history.len());
        let mut demand_targets = Vec::with_capacity(history.len());
        let mut price_targets = Vec::with_capacity(history.len());

        for obs in history {
            let (lag_demand, lag_price) = lags
                .get(&(obs.timestamp - Duration::hours(24)))
                .copied()
                .unwrap_or((mean_demand, mean_price));
            let base = calendar_features(obs.timestamp, self.peak_start_hour, self.peak_end_hour);

            let mut demand_row = base.clone();
            demand_row.push(lag_demand);
            let mut price_row = base;
            price_row.push(lag_price);
            price_row.push(obs.regulation_demand);

            demand_rows.push(demand_row);
            price_rows.push(price_row);
            demand_targets.push(obs.regulation_demand);
            price_targets.push(obs.regulation_price);
        }

        let demand_coefficients = ridge_fit(&demand_rows, &demand_targets, self.ridge_lambda)
            .ok_or_else(|| FitError("singular demand design matrix".to_string()))?;
        let price_coefficients = ridge_fit(&price_rows, &price_targets, self.ridge_lambda)
            .ok_or_else(|| FitError("singular price design matrix".to_string()))?;
        debug!("demand β = {:?}, price β = {:?}", demand_coefficients, price_coefficients);

        Ok(Box::new(RegressionModel {
            peak_start_hour: self.peak_start_hour,
            peak_end_hour: self.peak_end_hour,
            demand_coefficients,
            price_coefficients,
            lags,
            mean_demand,
            mean_price,
        }))
    }
}

impl FittedForecast for RegressionModel {
    fn predict(&self, hours: &[NaiveDateTime]) -> Vec<HourlyPrediction> {
        hours
            .iter()
            .map(|&timestamp| {
                let (lag_demand, lag_price) = self
                    .lags
                    .get(&(timestamp - Duration::hours(24)))
                    .copied()
                    .unwrap_or((self.mean_demand, self.mean_price));
                let base = calendar_features(timestamp, self.peak_start_hour, self.peak_end_hour);

                let mut demand_row = base.clone();
                demand_row.push(lag_demand);
                let regulation_demand = dot(&self.demand_coefficients, &demand_row);

                let mut price_row = base;
                price_row.push(lag_price);
                price_row.push(regulation_demand);
                let mileage_price = dot(&self.price_coefficients, &price_row);

                HourlyPrediction {
                    timestamp,
                    hour: timestamp.hour(),
                    regulation_demand,
                    mileage_price,
                }
            })
            .collect()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Solve `(XᵀX + λI) β = Xᵀy`
fn ridge_fit(rows: &[Vec<f64>], targets: &[f64], lambda: f64) -> Option<Vec<f64>> {
    let k = rows.first()?.len();
    let mut a = vec![vec![0.0; k + 1]; k];
    for (row, &y) in rows.iter().zip(targets) {
        for i in 0..k {
            for j in 0..k {
                a[i][j] += row[i] * row[j];
            }
            a[i][k] += row[i] * y;
        }
    }
    for (i, r) in a.iter_mut().enumerate() {
        r[i] += lambda;
    }
    gaussian_elimination(a)
}

/// Gaussian elimination with partial pivoting on an augmented matrix
fn gaussian_elimination(mut a: Vec<Vec<f64>>) -> Option<Vec<f64>> {
    let k = a.len();
    for col in 0..k {
        let pivot = (col..k).max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        for row in col + 1..k {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for j in col..=k {
                a[row][j] -= factor * a[col][j];
            }
        }
    }

    let mut beta = vec![0.0; k];
    for i in (0..k).rev() {
        let tail: f64 = (i + 1..k).map(|j| a[i][j] * beta[j]).sum();
        beta[i] = (a[i][k] - tail) / a[i][i];
    }
    beta.iter().all(|b| b.is_finite()).then_some(beta)
}

pub fn forecaster_for(model: ForecastModel, settings: &ForecastSettings) -> Box<dyn PriceForecaster> {
    match model {
        ForecastModel::RidgeRegression => Box::new(RegressionForecaster::from_settings(settings)),
        ForecastModel::SeasonalProfile => Box::new(SeasonalProfileForecaster),
        ForecastModel::HistoricalMean => Box::new(MeanBaselineForecaster {
            fallback_demand: settings.fallback_regulation_demand,
            fallback_price: settings.fallback_mileage_price,
        }),
    }
}

/// Applies the minimum-window rule, candidate selection, post-processing and quality
/// measurement around a set of replaceable forecasters
pub struct PricePredictor {
    settings: ForecastSettings,
    candidates: Vec<Box<dyn PriceForecaster>>,
}

impl PricePredictor {
    pub fn new(settings: ForecastSettings, candidates: Vec<Box<dyn PriceForecaster>>) -> Self {
        Self { settings, candidates }
    }

    /// Candidates as listed in `settings.models`
    pub fn standard(settings: ForecastSettings) -> Self {
        let candidates = settings
            .models
            .iter()
            .map(|&model| forecaster_for(model, &settings))
            .collect();
        Self::new(settings, candidates)
    }

    pub fn candidate_names(&self) -> Vec<&'static str> {
        self.candidates.iter().map(|c| c.name()).collect()
    }

    /// Forecast the 24 hours of `delivery_date` (default: the day after the last observation)
    pub fn forecast(&self, history: &FrequencyHistory, delivery_date: Option<NaiveDate>) -> FrequencyForecast {
        let date = delivery_date
            .or_else(|| history.last_timestamp().map(|t| t.date() + Duration::days(1)))
            .unwrap_or_default();
        let hours = delivery_hours(date);
        let observations = history.observations();
        let n = observations.len();

        if n < self.settings.min_history_hours {
            warn!(
                "{}: {} hourly observations (< {}); using historical mean",
                Stage::PricePrediction,
                n,
                self.settings.min_history_hours
            );
            return self.baseline(observations, &hours);
        }

        let forecast = match self.select_and_fit(observations, &hours) {
            Ok(forecast) => forecast,
            Err(err) => {
                warn!("{}: {}; using historical mean", Stage::PricePrediction, err);
                return self.baseline(observations, &hours);
            }
        };
        info!(
            "{} forecast for {}: mean price {:.2}, MAE {:?}, R² {:?}",
            forecast.model,
            date,
            forecast.mean_price(),
            forecast.mae,
            forecast.r_squared
        );
        forecast
    }

    fn baseline(&self, observations: &[FrequencyObservation], hours: &[NaiveDateTime]) -> FrequencyForecast {
        let baseline = MeanBaselineForecaster {
            fallback_demand: self.settings.fallback_regulation_demand,
            fallback_price: self.settings.fallback_mileage_price,
        };
        let predictions = match baseline.fit(observations) {
            Ok(model) => model.predict(hours),
            Err(_) => Vec::new(),
        };

        let mean = predictions.first().map(|p| p.mileage_price).unwrap_or_default();
        let pairs: Vec<(f64, f64)> = observations.iter().map(|o| (o.regulation_price, mean)).collect();
        let mae = (!pairs.is_empty()).then(|| mean_absolute_error(pairs.iter().copied()));

        FrequencyForecast {
            predictions,
            model: baseline.name(),
            degraded: true,
            observations: observations.len(),
            relative_mae: relative(mae, observations),
            mae,
            mae_in_sample: true,
            r_squared: r_squared(&pairs),
            candidates: Vec::new(),
            warnings: vec![RunWarning::ForecastDegraded {
                observations: observations.len(),
                required: self.settings.min_history_hours,
            }],
        }
    }

    /// Score a candidate on the held-out tail, or in sample when the window is too short
    fn score(
        &self,
        candidate: &dyn PriceForecaster,
        observations: &[FrequencyObservation],
    ) -> Result<CandidateScore, FitError> {
        let n = observations.len();
        let holdout = self.settings.holdout_hours;
        let in_sample = holdout == 0 || n < self.settings.min_history_hours + holdout;
        let (train, test) = if in_sample {
            (observations, observations)
        } else {
            observations.split_at(n - holdout)
        };

        let model = candidate.fit(train)?;
        let stamps: Vec<NaiveDateTime> = test.iter().map(|o| o.timestamp).collect();
        let predicted = self.post_process(model.predict(&stamps));
        let pairs: Vec<(f64, f64)> = test
            .iter()
            .zip(&predicted)
            .map(|(o, p)| (o.regulation_price, p.mileage_price))
            .collect();

        Ok(CandidateScore {
            model: candidate.name(),
            mae: mean_absolute_error(pairs.iter().copied()),
            r_squared: r_squared(&pairs),
            in_sample,
        })
    }

    fn select_and_fit(
        &self,
        observations: &[FrequencyObservation],
        hours: &[NaiveDateTime],
    ) -> Result<FrequencyForecast, FitError> {
        let mut scores: Vec<(usize, CandidateScore)> = Vec::with_capacity(self.candidates.len());
        let mut best: Option<usize> = None;
        for (index, candidate) in self.candidates.iter().enumerate() {
            match self.score(candidate.as_ref(), observations) {
                Ok(score) => {
                    debug!("{}: MAE {:.4}, R² {:?}", score.model, score.mae, score.r_squared);
                    if best.map_or(true, |b: usize| score.mae < scores[b].1.mae) {
                        best = Some(scores.len());
                    }
                    scores.push((index, score));
                }
                Err(err) => warn!("{}: {} skipped: {}", Stage::PricePrediction, candidate.name(), err),
            }
        }

        let best = best.ok_or_else(|| FitError("no candidate model could be fitted".to_string()))?;
        let (index, chosen) = scores[best].clone();
        let model = self.candidates[index].fit(observations)?;
        let predictions = self.post_process(model.predict(hours));
        debug_assert_eq!(predictions.len(), FREQUENCY_HOURS);

        Ok(FrequencyForecast {
            predictions,
            model: chosen.model,
            degraded: false,
            observations: observations.len(),
            mae: Some(chosen.mae),
            mae_in_sample: chosen.in_sample,
            relative_mae: relative(Some(chosen.mae), observations),
            r_squared: chosen.r_squared,
            candidates: scores.into_iter().map(|(_, score)| score).collect(),
            warnings: Vec::new(),
        })
    }

    /// Clip prices to `[0, price_upper_limit]` on the `price_min_unit` grid; demand ≥ 0
    fn post_process(&self, predictions: Vec<HourlyPrediction>) -> Vec<HourlyPrediction> {
        let unit = self.settings.price_min_unit;
        let upper = self.settings.price_upper_limit;
        predictions
            .into_iter()
            .map(|mut p| {
                let clipped = p.mileage_price.clamp(0.0, upper);
                p.mileage_price = (clipped / unit).round() / (1.0 / unit);
                p.regulation_demand = p.regulation_demand.max(0.0);
                p
            })
            .collect()
    }
}

fn mean_absolute_error(pairs: impl Iterator<Item = (f64, f64)>) -> f64 {
    let (sum, count) = pairs.fold((0.0, 0usize), |(s, n), (actual, predicted)| {
        (s + (actual - predicted).abs(), n + 1)
    });
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// `1 − SS_res / SS_tot` over `(actual, predicted)` pairs; `None` when the actuals are constant
fn r_squared(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.is_empty() {
        return None;
    }
    let mean = pairs.iter().map(|(actual, _)| actual).sum::<f64>() / pairs.len() as f64;
    let total: f64 = pairs.iter().map(|(actual, _)| (actual - mean).powi(2)).sum();
    let residual: f64 = pairs.iter().map(|(actual, predicted)| (actual - predicted).powi(2)).sum();
    (total > 0.0).then(|| 1.0 - residual / total)
}

fn relative(mae: Option<f64>, observations: &[FrequencyObservation]) -> Option<f64> {
    let mae = mae?;
    if observations.is_empty() {
        return None;
    }
    let scale = observations.iter().map(|o| o.regulation_price.abs()).sum::<f64>() / observations.len() as f64;
    (scale > 0.0).then(|| mae / scale)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Hourly history with a daily shape: evening peak in demand and price
    pub(crate) fn synthetic_history(hours: usize) -> FrequencyHistory {
        let start = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let observations = (0..hours)
            .map(|h| {
                let timestamp = start + Duration::hours(h as i64);
                let hour = timestamp.hour() as f64;
                let shape = (2.0 * PI * (hour - 12.0) / 24.0).cos();
                FrequencyObservation {
                    timestamp,
                    regulation_demand: 120.0 + 30.0 * shape,
                    regulation_price: 12.0 + 6.0 * shape,
                }
            })
            .collect();
        FrequencyHistory::try_new(observations).unwrap()
    }

    fn predictor() -> PricePredictor {
        PricePredictor::standard(ForecastSettings::default())
    }

    #[test]
    fn test_short_history_returns_mean_baseline() {
        let history = synthetic_history(5);
        let expected = history.mean_price().unwrap();

        let forecast = predictor().forecast(&history, None);

        assert!(forecast.degraded);
        assert_eq!(forecast.predictions.len(), 24);
        assert!(forecast.predictions.iter().all(|p| p.mileage_price == expected));
        assert!(matches!(
            forecast.warnings.as_slice(),
            [RunWarning::ForecastDegraded {
                observations: 5,
                required: 24
            }]
        ));
    }

    #[test]
    fn test_empty_history_uses_configured_fallback() {
        let forecast = predictor().forecast(&FrequencyHistory::default(), NaiveDate::from_ymd_opt(2024, 5, 1));
        assert!(forecast.degraded);
        assert!(forecast.mae.is_none());
        assert!(forecast.predictions.iter().all(|p| p.mileage_price == 25.0));
        assert_eq!(forecast.predictions[0].timestamp.date(), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }

    #[test]
    fn test_regression_tracks_daily_shape() {
        let history = synthetic_history(24 * 7);
        let forecast = predictor().forecast(&history, None);

        assert!(!forecast.degraded);
        assert!(!forecast.mae_in_sample);
        assert!(forecast.mae.unwrap() < 0.5);
        assert_eq!(forecast.predictions[0].timestamp, history.last_timestamp().unwrap() + Duration::hours(1));

        let noon = forecast.predictions[12].mileage_price;
        let midnight = forecast.predictions[0].mileage_price;
        assert!(noon > midnight);
    }

    #[test]
    fn test_outputs_clipped_and_rounded() {
        let history = synthetic_history(48);
        let settings = ForecastSettings {
            price_upper_limit: 15.0,
            ..ForecastSettings::default()
        };
        let forecast = PricePredictor::standard(settings).forecast(&history, None);

        for p in &forecast.predictions {
            assert!(p.mileage_price >= 0.0 && p.mileage_price <= 15.0);
            let scaled = p.mileage_price * 10.0;
            assert!((scaled - scaled.round()).abs() < 1e-9);
            assert!(p.regulation_demand >= 0.0);
        }
    }

    #[test]
    fn test_in_sample_mae_when_no_room_for_holdout() {
        let forecast = predictor().forecast(&synthetic_history(30), None);
        assert!(!forecast.degraded);
        assert!(forecast.mae_in_sample);
    }

    struct Failing;

    impl PriceForecaster for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn fit(&self, _: &[FrequencyObservation]) -> Result<Box<dyn FittedForecast>, FitError> {
            Err(FitError("boom".to_string()))
        }
    }

    #[test]
    fn test_fit_failure_degrades_instead_of_failing() {
        let predictor = PricePredictor::new(ForecastSettings::default(), vec![Box::new(Failing)]);
        let forecast = predictor.forecast(&synthetic_history(72), None);
        assert!(forecast.degraded);
        assert_eq!(forecast.model, "historical_mean");
        assert!(forecast.candidates.is_empty());
    }

    struct Constant {
        name: &'static str,
        price: f64,
    }

    impl PriceForecaster for Constant {
        fn name(&self) -> &'static str {
            self.name
        }
        fn fit(&self, _: &[FrequencyObservation]) -> Result<Box<dyn FittedForecast>, FitError> {
            Ok(Box::new(MeanBaseline {
                demand: 100.0,
                price: self.price,
            }))
        }
    }

    #[test]
    fn test_lowest_error_candidate_wins_and_ties_keep_order() {
        let candidates: Vec<Box<dyn PriceForecaster>> = vec![
            Box::new(Constant { name: "far", price: 40.0 }),
            Box::new(Failing),
            Box::new(Constant { name: "near", price: 12.0 }),
            Box::new(Constant { name: "near_again", price: 12.0 }),
        ];
        let predictor = PricePredictor::new(ForecastSettings::default(), candidates);
        let forecast = predictor.forecast(&synthetic_history(24 * 3), None);

        assert!(!forecast.degraded);
        assert_eq!(forecast.model, "near");
        assert!(forecast.predictions.iter().all(|p| p.mileage_price == 12.0));

        let names: Vec<&str> = forecast.candidates.iter().map(|c| c.model).collect();
        assert_eq!(names, vec!["far", "near", "near_again"]);
        assert_eq!(forecast.mae, Some(forecast.candidates[1].mae));
        assert!(forecast.candidates[0].mae > forecast.candidates[1].mae);
    }

    #[test]
    fn test_standard_candidates_scored_on_holdout() {
        let predictor = predictor();
        assert_eq!(
            predictor.candidate_names(),
            vec!["ridge_regression", "seasonal_profile", "historical_mean"]
        );

        let forecast = predictor.forecast(&synthetic_history(24 * 7), None);
        assert_eq!(forecast.candidates.len(), 3);
        assert!(forecast.candidates.iter().all(|c| !c.in_sample));

        let best = forecast
            .candidates
            .iter()
            .map(|c| c.mae)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(forecast.mae, Some(best));
        assert_ne!(forecast.model, "historical_mean");
        assert!(forecast.r_squared.unwrap() > 0.9);

        let mean = forecast.candidates.iter().find(|c| c.model == "historical_mean").unwrap();
        assert!(mean.r_squared.unwrap() < 0.1);
    }

    #[test]
    fn test_seasonal_profile_averages_each_hour() {
        let history = synthetic_history(48);
        let model = SeasonalProfileForecaster.fit(history.observations()).unwrap();
        let hours = delivery_hours(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
        let predicted = model.predict(&hours);

        assert_eq!(predicted.len(), 24);
        assert!((predicted[12].mileage_price - 18.0).abs() < 1e-9);
        assert!((predicted[0].mileage_price - 6.0).abs() < 1e-9);
        assert!((predicted[12].regulation_demand - 150.0).abs() < 1e-9);
    }

    #[test]
    fn test_r_squared() {
        assert_eq!(r_squared(&[(1.0, 1.0), (3.0, 3.0)]), Some(1.0));
        assert_eq!(r_squared(&[(1.0, 2.0), (3.0, 2.0)]), Some(0.0));
        assert_eq!(r_squared(&[(2.0, 1.0), (2.0, 3.0)]), None);
        assert_eq!(r_squared(&[]), None);
    }

    #[test]
    fn test_ridge_recovers_linear_model() {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![1.0, i as f64]).collect();
        let targets: Vec<f64> = (0..20).map(|i| 3.0 + 2.0 * i as f64).collect();
        let beta = ridge_fit(&rows, &targets, 1e-9).unwrap();
        assert!((beta[0] - 3.0).abs() < 1e-4);
        assert!((beta[1] - 2.0).abs() < 1e-4);
    }
}
