use crate::day_ahead::HourlyDispatch;
use crate::error::{
    ConstraintGroup, ConstraintViolation, EngineError, ErrorContext, Result, Stage,
};
use crate::models::{ParameterSet, FREQUENCY_HOURS};
use crate::price_predictor::FrequencyForecast;
use crate::solver::{solve_with_budget, Direction, LinearProgram, SolveError, SolverBackend, Sense};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

/// Capacity below this is treated as no headroom
const MIN_CAPACITY_MW: f64 = 1e-6;

const RELAXABLE_GROUPS: [ConstraintGroup; 3] = [
    ConstraintGroup::EconomicFloor,
    ConstraintGroup::SocBand,
    ConstraintGroup::CapacityLimit,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HourStatus {
    Committed,
    /// Best achievable profit does not clear the economic floor
    Uneconomic,
    /// The day-ahead schedule leaves no power or SOC room
    NoHeadroom,
}

/// Per-MW economics of one regulation hour
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HourlyUnitEconomics {
    pub capacity_revenue: f64,
    pub mileage_revenue: f64,
    pub degradation_cost: f64,
    pub efficiency_loss: f64,
    pub om_cost: f64,
}

impl HourlyUnitEconomics {
    pub fn margin(&self) -> f64 {
        self.capacity_revenue + self.mileage_revenue
            - self.degradation_cost
            - self.efficiency_loss
            - self.om_cost
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrequencyHourRecord {
    pub hour: usize,
    pub status: HourStatus,
    pub capacity_mw: f64,
    pub power_headroom_mw: f64,
    pub soc_headroom_mw: f64,
    pub mileage_price: f64,
    pub regulation_demand: f64,
    pub capacity_revenue: f64,
    pub mileage_revenue: f64,
    pub degradation_cost: f64,
    pub efficiency_loss_cost: f64,
    pub om_cost: f64,
    pub net_profit: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrequencySummary {
    pub committed_hours: usize,
    pub total_capacity_mwh: f64,
    pub max_capacity_mw: f64,
    pub min_capacity_mw: f64,
    pub avg_capacity_mw: f64,
    pub total_revenue: f64,
    pub total_cost: f64,
    pub total_profit: f64,
    /// Profit over revenue; zero when nothing is earned
    pub profit_margin: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrequencySchedule {
    pub hours: Vec<FrequencyHourRecord>,
    pub objective: f64,
    pub summary: FrequencySummary,
    pub solver: &'static str,
}

impl FrequencySchedule {
    /// All-zero schedule used when the stage cannot run
    pub fn idle(forecast: Option<&FrequencyForecast>) -> Self {
        let hours = (0..FREQUENCY_HOURS)
            .map(|hour| {
                let prediction = forecast.and_then(|f| f.predictions.get(hour));
                FrequencyHourRecord {
                    hour,
                    status: HourStatus::NoHeadroom,
                    capacity_mw: 0.0,
                    power_headroom_mw: 0.0,
                    soc_headroom_mw: 0.0,
                    mileage_price: prediction.map(|p| p.mileage_price).unwrap_or_default(),
                    regulation_demand: prediction.map(|p| p.regulation_demand).unwrap_or_default(),
                    capacity_revenue: 0.0,
                    mileage_revenue: 0.0,
                    degradation_cost: 0.0,
                    efficiency_loss_cost: 0.0,
                    om_cost: 0.0,
                    net_profit: 0.0,
                }
            })
            .collect::<Vec<_>>();
        let summary = summarize(&hours);
        Self {
            hours,
            objective: 0.0,
            summary,
            solver: "none",
        }
    }

    pub fn total_profit(&self) -> f64 {
        self.hours.iter().map(|h| h.net_profit).sum()
    }

    pub fn total_revenue(&self) -> f64 {
        self.hours
            .iter()
            .map(|h| h.capacity_revenue + h.mileage_revenue)
            .sum()
    }

    pub fn capacities(&self) -> Vec<f64> {
        self.hours.iter().map(|h| h.capacity_mw).collect()
    }

    /// Energy moved by regulation: `α` MWh per MW·h of reserved capacity
    pub fn regulation_throughput_mwh(&self, params: &ParameterSet) -> f64 {
        let alpha = params.tariff.regulation_activity_coefficient;
        self.hours.iter().map(|h| alpha * h.capacity_mw).sum()
    }

    /// Equivalent full cycles from regulation throughput
    pub fn regulation_cycles(&self, params: &ParameterSet) -> f64 {
        self.regulation_throughput_mwh(params) / (2.0 * params.battery.energy_capacity_mwh)
    }
}

fn summarize(hours: &[FrequencyHourRecord]) -> FrequencySummary {
    let committed: Vec<&FrequencyHourRecord> = hours
        .iter()
        .filter(|h| h.capacity_mw > MIN_CAPACITY_MW)
        .collect();
    let total_revenue: f64 = hours.iter().map(|h| h.capacity_revenue + h.mileage_revenue).sum();
    let total_cost: f64 = hours
        .iter()
        .map(|h| h.degradation_cost + h.efficiency_loss_cost + h.om_cost)
        .sum();
    let total_profit = total_revenue - total_cost;
    let total_capacity_mwh: f64 = hours.iter().map(|h| h.capacity_mw).sum();

    FrequencySummary {
        committed_hours: committed.len(),
        total_capacity_mwh,
        max_capacity_mw: committed.iter().map(|h| h.capacity_mw).fold(0.0, f64::max),
        min_capacity_mw: committed
            .iter()
            .map(|h| h.capacity_mw)
            .reduce(f64::min)
            .unwrap_or_default(),
        avg_capacity_mw: if committed.is_empty() {
            0.0
        } else {
            total_capacity_mwh / committed.len() as f64
        },
        total_revenue,
        total_cost,
        total_profit,
        profit_margin: if total_revenue > 0.0 {
            total_profit / total_revenue
        } else {
            0.0
        },
    }
}

/// Regulation capacity bidding over the 24 hours of the delivery day
pub struct FrequencyOptimizer<'a> {
    params: &'a ParameterSet,
    backend: Arc<dyn SolverBackend>,
}

impl<'a> FrequencyOptimizer<'a> {
    pub fn new(params: &'a ParameterSet, backend: Arc<dyn SolverBackend>) -> Self {
        Self { params, backend }
    }

    pub fn unit_economics(&self, mileage_price: f64, day_ahead_price: f64) -> HourlyUnitEconomics {
        let b = &self.params.battery;
        let t = &self.params.tariff;
        let alpha = t.regulation_activity_coefficient;
        HourlyUnitEconomics {
            capacity_revenue: t.approved_cost_rate,
            mileage_revenue: mileage_price * t.mileage_compensation_rate * t.measured_adjustment_rate,
            degradation_cost: alpha * b.degradation_cost_per_mwh(),
            efficiency_loss: alpha * (1.0 - b.round_trip_efficiency()) * day_ahead_price.max(0.0),
            om_cost: t.om_cost_rate,
        }
    }

    /// Largest capacity the day-ahead power trajectory leaves in this hour
    pub fn power_headroom(&self, hour: &HourlyDispatch) -> f64 {
        let b = &self.params.battery;
        let t = &self.params.tariff;
        let mut headroom = b.rated_power_mw * (1.0 - t.power_safety_margin) - hour.max_abs_net_mw;
        if let Some(cap) = t.max_capacity_mw {
            headroom = headroom.min(cap);
        }
        headroom.max(0.0)
    }

    /// Largest capacity whose `α·C` swing keeps this hour inside the SOC band
    pub fn soc_headroom(&self, hour: &HourlyDispatch) -> f64 {
        let b = &self.params.battery;
        let alpha = self.params.tariff.regulation_activity_coefficient;
        if alpha <= 0.0 {
            return f64::INFINITY;
        }
        let down = (hour.min_energy_mwh - b.min_energy_mwh()).max(0.0) * b.discharge_efficiency / alpha;
        let up = (b.max_energy_mwh() - hour.max_energy_mwh).max(0.0) / (alpha * b.charge_efficiency);
        down.min(up)
    }

    pub fn optimize(
        &self,
        forecast: &FrequencyForecast,
        day_ahead: &[HourlyDispatch],
        snapshot_id: &str,
    ) -> Result<FrequencySchedule> {
        let context = ErrorContext::new(Stage::Frequency, snapshot_id);
        if forecast.predictions.len() != FREQUENCY_HOURS || day_ahead.len() != FREQUENCY_HOURS {
            return Err(EngineError::Infeasible {
                context,
                violations: vec![ConstraintViolation {
                    group: ConstraintGroup::CapacityLimit,
                    detail: format!(
                        "expected {} forecast and day-ahead hours, got {} and {}",
                        FREQUENCY_HOURS,
                        forecast.predictions.len(),
                        day_ahead.len()
                    ),
                }],
            });
        }

        let floor = self.params.tariff.min_hourly_profit;
        let mut lp = LinearProgram::new(Direction::Maximise);
        let mut plan = Vec::with_capacity(FREQUENCY_HOURS);

        for (h, (prediction, hour)) in forecast.predictions.iter().zip(day_ahead).enumerate() {
            let economics = self.unit_economics(prediction.mileage_price, hour.mean_price);
            let margin = economics.margin();
            let power = self.power_headroom(hour);
            let soc = self.soc_headroom(hour);
            let best = power.min(soc);

            let status = if best <= MIN_CAPACITY_MW {
                HourStatus::NoHeadroom
            } else if margin * best <= floor {
                HourStatus::Uneconomic
            } else {
                HourStatus::Committed
            };

            let c = lp.add_var(format!("reg_{}", h), 0.0, Some(self.params.battery.rated_power_mw));
            lp.add_objective_term(c, margin);
            lp.add_row(ConstraintGroup::CapacityLimit, vec![(c, 1.0)], Sense::Le, power);
            if soc.is_finite() {
                lp.add_row(ConstraintGroup::SocBand, vec![(c, 1.0)], Sense::Le, soc);
            }
            match status {
                HourStatus::Committed => {
                    lp.add_row(ConstraintGroup::EconomicFloor, vec![(c, margin)], Sense::Ge, floor);
                }
                HourStatus::Uneconomic => {
                    lp.add_row(ConstraintGroup::EconomicFloor, vec![(c, 1.0)], Sense::Le, 0.0);
                }
                HourStatus::NoHeadroom => {}
            }
            debug!(
                "hour {:02}: margin {:.3}/MW, power {:.3} MW, soc {:.3} MW → {:?}",
                h, margin, power, soc, status
            );
            plan.push((c, status, economics, power, soc));
        }

        let solution = match solve_with_budget(&self.backend, &lp, &self.params.solver) {
            Ok(solution) => solution,
            Err(failure) if failure.error == SolveError::Infeasible => {
                let violations = self.diagnose(&lp);
                return Err(failure.into_engine_error(context, violations));
            }
            Err(failure) => return Err(failure.into_engine_error(context, Vec::new())),
        };

        let hours: Vec<FrequencyHourRecord> = plan
            .into_iter()
            .zip(&forecast.predictions)
            .enumerate()
            .map(|(hour, ((var, status, economics, power, soc), prediction))| {
                let capacity = solution.value(var);
                let status = if status == HourStatus::Committed && capacity <= MIN_CAPACITY_MW {
                    HourStatus::Uneconomic
                } else {
                    status
                };
                let capacity_revenue = economics.capacity_revenue * capacity;
                let mileage_revenue = economics.mileage_revenue * capacity;
                let degradation_cost = economics.degradation_cost * capacity;
                let efficiency_loss_cost = economics.efficiency_loss * capacity;
                let om_cost = economics.om_cost * capacity;
                FrequencyHourRecord {
                    hour,
                    status,
                    capacity_mw: capacity,
                    power_headroom_mw: power,
                    soc_headroom_mw: if soc.is_finite() { soc } else { power },
                    mileage_price: prediction.mileage_price,
                    regulation_demand: prediction.regulation_demand,
                    capacity_revenue,
                    mileage_revenue,
                    degradation_cost,
                    efficiency_loss_cost,
                    om_cost,
                    net_profit: capacity_revenue + mileage_revenue
                        - degradation_cost
                        - efficiency_loss_cost
                        - om_cost,
                }
            })
            .collect();

        let summary = summarize(&hours);
        info!(
            "Frequency schedule: {} committed hour(s), {:.2} MWh reserved, profit {:.2}",
            summary.committed_hours, summary.total_capacity_mwh, summary.total_profit
        );

        Ok(FrequencySchedule {
            hours,
            objective: solution.objective,
            summary,
            solver: self.backend.name(),
        })
    }

    fn diagnose(&self, lp: &LinearProgram) -> Vec<ConstraintViolation> {
        RELAXABLE_GROUPS
            .iter()
            .filter(|&&group| lp.constrains(group))
            .filter(|&&group| solve_with_budget(&self.backend, &lp.without_group(group), &self.params.solver).is_ok())
            .map(|&group| ConstraintViolation {
                group,
                detail: format!("removing the {} rows restores feasibility", group),
            })
            .collect()
    }
}
