use anyhow::{bail, Result};
use bidding_engine::{DataLoader, ParameterSet};
use std::path::PathBuf;

mod batch_runner;
mod report_writer;

use batch_runner::{discover_price_files, BacktestRunner};
use report_writer::ReportWriter;

fn usage() {
    println!("Usage:");
    println!("  --backtest <price_dir> <history_csv|-> [--params <json>] [--output <dir>]");
    println!("  --print-params [--params <json>]");
    println!();
    println!("Price files are discovered as <price_dir>/da_prices_YYYYMMDD.csv.");
    println!("Pass '-' as the history to run the day-ahead market only.");
}

fn option_value(args: &[String], flag: &str) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn load_params(args: &[String]) -> Result<ParameterSet> {
    match option_value(args, "--params") {
        Some(path) => {
            log::info!("Parameters from {}", path.display());
            Ok(ParameterSet::from_json_file(&path)?)
        }
        None => Ok(ParameterSet::default()),
    }
}

fn run_backtest(args: &[String]) -> Result<()> {
    if args.len() < 4 {
        usage();
        bail!("--backtest needs a price directory and a history file");
    }
    let price_dir = PathBuf::from(&args[2]);
    let history_arg = &args[3];
    let output_dir = option_value(args, "--output").unwrap_or_else(|| PathBuf::from("backtest_output"));

    println!("🔋 Flow Battery Bidding Backtest");
    println!("Using {} CPU cores", num_cpus::get());
    println!("{}", "=".repeat(60));

    let params = load_params(args)?;

    let history = if history_arg == "-" {
        None
    } else {
        let history = DataLoader::load_frequency_history(&PathBuf::from(history_arg))?;
        println!("📈 Loaded {} hours of regulation history", history.len());
        Some(history)
    };

    let days = discover_price_files(&price_dir)?;
    if days.is_empty() {
        bail!("no da_prices_YYYYMMDD.csv files in {}", price_dir.display());
    }
    println!("📁 Found {} day-ahead price files", days.len());

    let start = std::time::Instant::now();
    let runner = BacktestRunner::new(params, history)?;
    let outcomes = runner.run(&days);

    let writer = ReportWriter::new(&output_dir)?;
    let paths = writer.write(&outcomes)?;

    let total: f64 = outcomes.iter().map(|o| o.total_profit).sum();
    println!("\n📊 Total profit across {} days: {:.2}", outcomes.len(), total);
    println!("   Daily results: {}", paths.days_csv.display());
    println!("   Parquet:       {}", paths.days_parquet.display());
    println!("   By mode:       {}", paths.by_mode_csv.display());
    println!("\n✅ Backtest complete in {:?}!", start.elapsed());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()?;

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--backtest" {
        run_backtest(&args)?;
    } else if args.len() > 1 && args[1] == "--print-params" {
        let params = load_params(&args)?;
        println!("{}", serde_json::to_string_pretty(&params)?);
    } else {
        usage();
    }

    Ok(())
}
