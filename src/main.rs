use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use walkforward::{
    commands::{self, backtest, export_market_data, optimize, walkforward as walk_forward},
    config::RuntimeSettings,
    context::AppContext,
};

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "walkforward")]
#[command(about = "Walk-forward backtesting and parameter search for trading strategies")]
struct Cli {
    /// Market data snapshot (.bin or .json); falls back to WALKFORWARD_PRICE_API_URL
    #[arg(long = "data-file", value_name = "PATH", global = true)]
    data_file: Option<PathBuf>,
    /// Base URL of the price service; overrides WALKFORWARD_PRICE_API_URL
    #[arg(long = "price-api", value_name = "URL", global = true)]
    price_api: Option<String>,
    /// Write the JSON result here instead of stdout
    #[arg(short, long = "output", value_name = "PATH", global = true)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest a request over its full date range
    Backtest {
        /// JSON backtest request
        #[arg(long, value_name = "FILE")]
        request: PathBuf,
    },
    /// Run a windowed walk-forward backtest and aggregate the stitched slides
    Walkforward {
        /// JSON backtest request
        #[arg(long, value_name = "FILE")]
        request: PathBuf,
    },
    /// Search strategy parameters, scoring each trial with a walk-forward run
    Optimize {
        /// JSON optimization request
        #[arg(long, value_name = "FILE")]
        request: PathBuf,
    },
    /// Write a binary snapshot: the whole --data-file, or a symbol/date selection from the price source
    ExportMarketData {
        /// Symbols to export; omit to convert the whole --data-file
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        symbols: Vec<String>,
        #[arg(long, requires = "symbols")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "symbols")]
        end: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli {
        data_file,
        price_api,
        output,
        command,
    } = Cli::parse();

    let mut runtime = RuntimeSettings::from_env()?;
    if price_api.is_some() {
        runtime.price_api_url = price_api;
    }
    info!(
        "Runtime: {} workers, {}-year windows, stitching {} segments",
        runtime.workers, runtime.window_years, runtime.stitch_length
    );
    let app = AppContext::initialize(data_file.as_deref(), runtime)?;

    match command {
        Commands::Backtest { request } => {
            backtest::run(&app, commands::read_json(&request)?, output.as_deref()).await?;
        }
        Commands::Walkforward { request } => {
            walk_forward::run(&app, commands::read_json(&request)?, output.as_deref()).await?;
        }
        Commands::Optimize { request } => {
            optimize::run(&app, commands::read_json(&request)?, output.as_deref()).await?;
        }
        Commands::ExportMarketData {
            symbols,
            start,
            end,
        } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            if symbols.is_empty() {
                let input = data_file
                    .ok_or_else(|| anyhow!("--data-file is required when no --symbols are given"))?;
                export_market_data::convert(&input, &output_path)?;
            } else {
                let (Some(start), Some(end)) = (start, end) else {
                    return Err(anyhow!("--start and --end are required with --symbols"));
                };
                export_market_data::run(&app, &symbols, start, end, &output_path).await?;
            }
        }
    }

    Ok(())
}
