use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use uuid::Uuid;
use walkforward::commands::{backtest, export_market_data, optimize, walkforward as walk_forward};
use walkforward::config::RuntimeSettings;
use walkforward::context::AppContext;
use walkforward::data_context::MarketData;
use walkforward::models::{PriceBar, StrategyResult, TaskRecord, TaskStatus};
use walkforward::optimizer::StrategyOptimizationResult;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("walkforward-pipeline-{}", Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn write_bars(&self, name: &str, bars: &[PriceBar]) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, serde_json::to_vec(bars).unwrap()).unwrap();
        path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn daily_bars(symbol: &str, start: NaiveDate, closes: impl IntoIterator<Item = f64>) -> Vec<PriceBar> {
    closes
        .into_iter()
        .enumerate()
        .map(|(i, close)| PriceBar {
            symbol: symbol.to_string(),
            date: start + Duration::days(i as i64),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000.0,
        })
        .collect()
}

/// Oscillating series so momentum and crossover rules trade regularly.
fn wave(symbol: &str, start: NaiveDate, days: usize) -> Vec<PriceBar> {
    daily_bars(
        symbol,
        start,
        (0..days).map(|i| 100.0 + 10.0 * ((i as f64) / 15.0).sin() + i as f64 * 0.02),
    )
}

fn runtime() -> RuntimeSettings {
    RuntimeSettings {
        workers: 2,
        poll_interval: std::time::Duration::from_millis(10),
        ..RuntimeSettings::default()
    }
}

fn read<T: serde::de::DeserializeOwned>(path: &Path) -> T {
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backtest_command_fills_crossover_on_next_bar() -> Result<()> {
    ensure_test_env();
    let workspace = Workspace::new();
    let data_file = workspace.write_bars(
        "prices.json",
        &daily_bars("AAA", date(2024, 1, 1), [10.0, 11.0, 12.0, 11.0, 10.0]),
    );
    let app = AppContext::initialize(Some(&data_file), runtime())?;

    let request = serde_json::from_value(json!({
        "startDate": "2024-01-01",
        "endDate": "2024-01-05",
        "symbols": [{"symbol": "AAA", "strategy": "sma_crossover"}],
        "strategyParams": {"sma_crossover": {"shortPeriod": 1, "longPeriod": 2}},
        "settings": {"initialCapital": 1000},
        "lookback": 0
    }))?;
    let output = workspace.path("backtest.json");
    backtest::run(&app, request, Some(&output)).await?;

    let results: Vec<StrategyResult> = read(&output);
    assert_eq!(results.len(), 2);
    let key = &results[0];
    assert_eq!(key.key, "AAA_sma_crossover");
    assert_eq!(key.trades.len(), 1);
    assert_eq!(key.trades[0].entry_price, 11.0);
    assert_eq!(key.trades[0].exit_price, 10.0);
    assert!((key.final_capital.unwrap() - 1000.0 * 10.0 / 11.0).abs() < 1e-9);

    let overall = &results[1];
    assert!(overall.is_overall());
    assert!((overall.final_capital.unwrap() - key.final_capital.unwrap()).abs() < 1e-9);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walkforward_command_stitches_every_slide() -> Result<()> {
    ensure_test_env();
    let workspace = Workspace::new();
    let data_file = workspace.write_bars("prices.json", &wave("AAA", date(2019, 1, 1), 1_250));
    let app = AppContext::initialize(Some(&data_file), runtime())?;

    let request = serde_json::from_value(json!({
        "startDate": "2019-03-01",
        "endDate": "2022-03-01",
        "symbols": [{"symbol": "AAA", "strategy": "momentum"}],
        "strategyParams": {"momentum": {"lookback": 5}},
        "windowYears": 1,
        "windowLength": 2
    }))?;
    let output = workspace.path("walkforward.json");
    walk_forward::run(&app, request, Some(&output)).await?;

    let record: TaskRecord = read(&output);
    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.total_segments, 3);
    assert_eq!(record.results.len(), 3);
    assert_eq!(record.overall_progress, 100.0);
    assert!(record.progress.values().all(|progress| progress.done));

    let aggregated = record.aggregated_results.expect("aggregated results");
    assert_eq!(aggregated.len(), 1);
    let momentum = &aggregated[0];
    assert_eq!(momentum.symbol, "AAA");
    assert_eq!(momentum.segments, 2);
    assert_eq!(
        momentum.active_segments + momentum.no_trade_segments,
        momentum.segments
    );
    assert!(app.tasks().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn optimize_command_reports_every_trial() -> Result<()> {
    ensure_test_env();
    let workspace = Workspace::new();
    let data_file = workspace.write_bars("prices.json", &wave("AAA", date(2019, 1, 1), 800));
    let app = AppContext::initialize(Some(&data_file), runtime())?;

    let request = serde_json::from_value(json!({
        "backtest": {
            "startDate": "2019-02-01",
            "endDate": "2021-02-01",
            "symbols": [{"symbol": "AAA", "strategy": "momentum"}],
            "windowLength": 1
        },
        "searchSpaces": {
            "momentum": {"parameters": [
                {"name": "lookback", "type": "int", "min": 3, "max": 20}
            ]}
        },
        "trials": 3,
        "algorithm": "local"
    }))?;
    let output = workspace.path("optimize.json");
    optimize::run(&app, request, Some(&output)).await?;

    let results: Vec<StrategyOptimizationResult> = read(&output);
    assert_eq!(results.len(), 1);
    let momentum = &results[0];
    assert_eq!(momentum.strategy, "momentum");
    assert_eq!(momentum.trials.len(), 3);
    assert!(momentum.trials.iter().all(|trial| trial.error.is_none()));
    let best = momentum.best_score.expect("best score");
    assert!(momentum.trials.iter().all(|trial| trial.score <= best));
    assert!(momentum.best_basic_params.contains_key("lookback"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exported_snapshot_loads_back() -> Result<()> {
    ensure_test_env();
    let workspace = Workspace::new();
    let mut bars = wave("AAA", date(2020, 1, 1), 60);
    bars.extend(wave("BBB", date(2020, 1, 1), 60));
    let data_file = workspace.write_bars("prices.json", &bars);
    let app = AppContext::initialize(Some(&data_file), runtime())?;

    let snapshot = workspace.path("nested/market-data.bin");
    export_market_data::run(
        &app,
        &["aaa".to_string()],
        date(2020, 1, 10),
        date(2020, 1, 31),
        &snapshot,
    )
    .await?;

    let loaded = MarketData::load_from_file(&snapshot)?;
    assert_eq!(loaded.symbols(), vec!["AAA".to_string()]);
    let exported = loaded.bars("AAA");
    assert_eq!(exported.len(), 22);
    assert_eq!(exported[0].date, date(2020, 1, 10));

    let converted = workspace.path("full.bin");
    export_market_data::convert(&data_file, &converted)?;
    let full = MarketData::load_from_file(&converted)?;
    assert_eq!(full.symbols(), vec!["AAA".to_string(), "BBB".to_string()]);
    assert_eq!(full.bars("BBB").len(), 60);
    Ok(())
}
