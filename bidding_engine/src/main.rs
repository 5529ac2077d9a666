use anyhow::{Context, Result};
use bidding_engine::{
    BidTable, DataLoader, FrequencyHistory, MarketSelection, MultiMarketCoordinator, OptimizationOutcome,
    ParameterSet,
};
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use log::info;
use std::fs::File;
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bidding_engine")]
#[command(about = "Day-ahead and frequency-regulation bidding for a flow battery")]
struct Args {
    /// Parameter set as JSON (overrides --preset)
    #[arg(long)]
    params: Option<PathBuf>,

    /// Built-in parameter preset
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// Day-ahead price forecast CSV (96 quarter-hour rows)
    #[arg(long)]
    day_ahead: Option<PathBuf>,

    /// Hourly regulation history CSV
    #[arg(long)]
    frequency_history: Option<PathBuf>,

    /// Delivery date (YYYY-MM-DD); defaults to the day after the history ends
    #[arg(long)]
    delivery_date: Option<String>,

    #[arg(short, long, value_enum, default_value = "single")]
    market: Market,

    #[arg(short, long, value_enum, default_value = "summary")]
    output: OutputFormat,

    /// Write the submission table of the selected mode as CSV
    #[arg(long)]
    bid_table: Option<PathBuf>,

    /// Print the effective parameter set as JSON and exit
    #[arg(long)]
    print_params: bool,
}

#[derive(Clone, ValueEnum)]
enum Preset {
    Default,
    LargeStation,
}

#[derive(Clone, ValueEnum)]
enum Market {
    Single,
    Multi,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Summary,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let params = match &args.params {
        Some(path) => ParameterSet::from_json_file(path)
            .with_context(|| format!("loading parameters from {}", path.display()))?,
        None => match args.preset {
            Preset::Default => ParameterSet::default(),
            Preset::LargeStation => ParameterSet::large_station(),
        },
    };

    if args.print_params {
        println!("{}", serde_json::to_string_pretty(&params)?);
        return Ok(());
    }

    let day_ahead_path = args
        .day_ahead
        .as_ref()
        .context("--day-ahead is required unless --print-params is given")?;
    let prices = DataLoader::load_day_ahead_prices(day_ahead_path)?;
    info!("Loaded {} day-ahead periods", prices.points().len());

    let selection = match args.market {
        Market::Single => MarketSelection::SingleMarket,
        Market::Multi => MarketSelection::MultiMarket,
    };

    let history = match &args.frequency_history {
        Some(path) => Some(DataLoader::load_frequency_history(path)?),
        None => None,
    };
    if selection == MarketSelection::MultiMarket && history.is_none() {
        info!("No regulation history given; the forecast will use fallback prices");
    }

    let delivery_date = match &args.delivery_date {
        Some(date) => Some(NaiveDate::parse_from_str(date, "%Y-%m-%d")?),
        None => history
            .as_ref()
            .and_then(FrequencyHistory::last_timestamp)
            .and_then(|ts| ts.date().succ_opt()),
    };

    let mut coordinator = MultiMarketCoordinator::new(params)?;
    if let Some(date) = delivery_date {
        coordinator = coordinator.with_delivery_date(date);
    }
    let outcome = coordinator.optimize(&prices, selection, history.as_ref())?;

    for warning in outcome.warnings() {
        log::warn!("{}", warning);
    }

    if let Some(path) = &args.bid_table {
        let decision = outcome.decision();
        let table = BidTable::from_result(&decision.result, coordinator.params().day_ahead.segments.len());
        table.write_csv(File::create(path)?)?;
        info!("Wrote {} bid rows to {}", table.len(), path.display());
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        OutputFormat::Csv => write_schedule_csv(&outcome)?,
        OutputFormat::Summary => print_summary(&outcome, coordinator.params()),
    }

    Ok(())
}

fn write_schedule_csv(outcome: &OptimizationOutcome) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(io::stdout());
    match outcome {
        OptimizationOutcome::DayAheadOnly(decision) => {
            for period in &decision.result.schedule {
                wtr.serialize(period)?;
            }
        }
        OptimizationOutcome::Joint(joint) => {
            for period in &joint.periods {
                wtr.serialize(period)?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

fn print_summary(outcome: &OptimizationOutcome, params: &ParameterSet) {
    let decision = outcome.decision();
    let result = &decision.result;

    println!("Bidding Summary");
    println!("===============");
    println!(
        "Battery: {} MW / {} MWh, round trip {:.1}%",
        params.battery.rated_power_mw,
        params.battery.energy_capacity_mwh,
        params.battery.round_trip_efficiency() * 100.0
    );
    println!("Selected mode: {}", decision.selected);
    match decision.rarr {
        Some(rarr) => println!("RARR: {:.4}", rarr),
        None => println!("RARR: n/a (single candidate)"),
    }
    if let Some(profit) = decision.quantity_only_profit {
        println!("  quantity_only expected profit:      {:>12.2}", profit);
    }
    if let Some(profit) = decision.quantity_and_price_profit {
        println!("  quantity_and_price expected profit: {:>12.2}", profit);
    }
    println!();
    println!("Day-ahead");
    println!("  Discharge revenue: {:>12.2}", result.profit.discharge_revenue);
    println!("  Charge cost:       {:>12.2}", result.profit.charge_cost);
    println!("  Degradation:       {:>12.2}", result.profit.degradation_cost);
    println!("  O&M:               {:>12.2}", result.profit.om_cost);
    println!("  Net profit:        {:>12.2}", result.profit.net_profit);
    println!("  Cycles:            {:>12.3}", result.cycles);
    println!("  Throughput (MWh):  {:>12.2}", result.profit.throughput_mwh);
    println!("  Profit per MWh:    {:>12.2}", result.profit.profit_per_mwh);
    println!("  Final SOC:         {:>12.3}", result.final_soc());

    if let OptimizationOutcome::Joint(joint) = outcome {
        let kpis = &joint.kpis;
        println!();
        println!("Frequency regulation ({})", joint.forecast.model);
        if let Some(r2) = joint.forecast.r_squared {
            println!("  Forecast R²:       {:>12.3}", r2);
        }
        println!("  Committed hours:   {:>12}", joint.frequency.summary.committed_hours);
        println!("  Capacity (MWh):    {:>12.2}", joint.frequency.summary.total_capacity_mwh);
        println!("  Net profit:        {:>12.2}", kpis.frequency_profit);
        println!();
        println!("Joint");
        println!("  Total profit:      {:>12.2}", kpis.total_profit);
        println!("  Incremental:       {:>12.2}", kpis.incremental_revenue);
        match kpis.uplift_pct {
            Some(uplift) => println!("  Uplift:            {:>11.1}%", uplift),
            None => println!("  Uplift:                     n/a"),
        }
        println!("  Total cycles:      {:>12.3}", kpis.total_cycles);
        println!("  Throughput (MWh):  {:>12.2}", kpis.energy_throughput_mwh);
        println!("  Profit per MWh:    {:>12.2}", kpis.profit_per_mwh);
        println!("  Risk:              {:>12}", format!("{:?}", kpis.risk));
    }

    let warnings = outcome.warnings();
    if !warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in warnings {
            println!("  - {}", warning);
        }
    }
}
