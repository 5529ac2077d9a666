use crate::day_ahead::{DayAheadResult, FlowDirection};
use crate::models::{BiddingMode, PERIODS_PER_HOUR};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BidAction {
    Charge,
    Discharge,
    Idle,
}

/// Row of a quantity-only submission
#[derive(Debug, Clone, Serialize)]
pub struct QuantityBidRow {
    pub period_index: usize,
    pub time_window: String,
    pub action: BidAction,
    pub declared_mw: f64,
    pub forecast_price: f64,
    /// Positive for discharge revenue, negative for charge cost
    pub expected_cash_flow: f64,
}

/// Row of a segmented quantity-and-price submission
#[derive(Debug, Clone, Serialize)]
pub struct SegmentBidRow {
    pub period_index: usize,
    pub time_window: String,
    pub action: BidAction,
    pub segment: String,
    pub from_mw: f64,
    pub to_mw: f64,
    pub limit_price: f64,
    pub clearing_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum BidTable {
    QuantityOnly(Vec<QuantityBidRow>),
    Segmented(Vec<SegmentBidRow>),
}

/// Rows below this many MW are treated as idle
const MIN_DECLARED_MW: f64 = 1e-4;

pub fn segment_label(segment: usize, segments: usize) -> String {
    match (segment, segments) {
        (0, 3) => "conservative".to_string(),
        (1, 3) => "core".to_string(),
        (2, 3) => "aggressive".to_string(),
        _ => format!("segment_{}", segment + 1),
    }
}

/// `HH:MM-HH:MM` window of a 1-based quarter-hour period
pub fn time_window(period_index: usize) -> String {
    let start = (period_index.saturating_sub(1)) * 15;
    let end = start + 15;
    format!(
        "{:02}:{:02}-{:02}:{:02}",
        start / 60,
        start % 60,
        (end / 60) % 24,
        end % 60
    )
}

impl BidTable {
    pub fn from_result(result: &DayAheadResult, segment_count: usize) -> Self {
        match result.mode {
            BiddingMode::QuantityOnly => BidTable::QuantityOnly(quantity_rows(result)),
            BiddingMode::QuantityAndPrice => BidTable::Segmented(segment_rows(result, segment_count)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BidTable::QuantityOnly(rows) => rows.len(),
            BidTable::Segmented(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> csv::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        match self {
            BidTable::QuantityOnly(rows) => {
                for row in rows {
                    wtr.serialize(row)?;
                }
            }
            BidTable::Segmented(rows) => {
                for row in rows {
                    wtr.serialize(row)?;
                }
            }
        }
        wtr.flush()?;
        Ok(())
    }
}

fn quantity_rows(result: &DayAheadResult) -> Vec<QuantityBidRow> {
    let dt = 1.0 / PERIODS_PER_HOUR as f64;
    result
        .schedule
        .iter()
        .map(|p| {
            let (action, declared_mw) = if p.discharge_mw > MIN_DECLARED_MW {
                (BidAction::Discharge, p.discharge_mw)
            } else if p.charge_mw > MIN_DECLARED_MW {
                (BidAction::Charge, p.charge_mw)
            } else {
                (BidAction::Idle, 0.0)
            };
            let expected_cash_flow = match action {
                BidAction::Discharge => p.price * declared_mw * dt,
                BidAction::Charge => -p.price * declared_mw * dt,
                BidAction::Idle => 0.0,
            };
            QuantityBidRow {
                period_index: p.period_index,
                time_window: time_window(p.period_index),
                action,
                declared_mw,
                forecast_price: p.price,
                expected_cash_flow,
            }
        })
        .collect()
}

fn segment_rows(result: &DayAheadResult, segment_count: usize) -> Vec<SegmentBidRow> {
    let mut rows = Vec::new();
    for bid in &result.bids {
        for direction in [FlowDirection::Charge, FlowDirection::Discharge] {
            let mut cumulative = 0.0;
            for offer in bid
                .segments
                .iter()
                .filter(|o| o.direction == direction && o.quantity_mw > MIN_DECLARED_MW)
            {
                let from_mw = cumulative;
                cumulative += offer.quantity_mw;
                rows.push(SegmentBidRow {
                    period_index: bid.period_index,
                    time_window: time_window(bid.period_index),
                    action: match direction {
                        FlowDirection::Charge => BidAction::Charge,
                        FlowDirection::Discharge => BidAction::Discharge,
                    },
                    segment: segment_label(offer.segment, segment_count),
                    from_mw,
                    to_mw: cumulative,
                    limit_price: offer.limit_price,
                    clearing_probability: offer.clearing_probability,
                });
            }
        }
    }
    rows
}
