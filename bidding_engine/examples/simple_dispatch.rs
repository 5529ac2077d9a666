use bidding_engine::{optimize, BidTable, DayAheadPriceSeries, MarketSelection, OptimizationOutcome, ParameterSet};

fn main() {
    let params = ParameterSet::default();

    // One day of quarter-hour prices with a cheap night and an evening peak
    let prices: Vec<f64> = (0..96)
        .map(|t| match t / 4 {
            0..=5 | 23 => 150.0,
            17..=20 => 600.0,
            _ => 320.0,
        })
        .collect();
    let series = DayAheadPriceSeries::from_prices(&prices).expect("96 finite prices");

    let outcome = optimize(&params, &series, MarketSelection::SingleMarket, None).expect("day-ahead plan");
    let OptimizationOutcome::DayAheadOnly(decision) = &outcome else {
        unreachable!("single-market runs return the day-ahead decision");
    };

    println!("Day-Ahead Dispatch");
    println!("==================");
    println!("Mode: {}", decision.selected);
    if let Some(rarr) = decision.rarr {
        println!("RARR: {:.4}", rarr);
    }
    println!("Net profit: {:.2}", decision.result.profit.net_profit);
    println!("Cycles: {:.3}", decision.result.cycles);
    println!();

    println!("Hourly profile:");
    for hour in decision.result.hourly_profile(&params.battery) {
        if hour.mean_charge_mw > 1e-6 || hour.mean_discharge_mw > 1e-6 {
            println!(
                "  {:02}:00  price {:>7.2}  charge {:>6.2} MW  discharge {:>6.2} MW",
                hour.hour, hour.mean_price, hour.mean_charge_mw, hour.mean_discharge_mw
            );
        }
    }

    let table = BidTable::from_result(&decision.result, params.day_ahead.segments.len());
    println!();
    println!("Bid table rows: {}", table.len());
}
