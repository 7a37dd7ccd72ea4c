use crate::commands::write_json;
use crate::context::AppContext;
use crate::engine::BacktestRunner;
use crate::request::{unique_symbols, BacktestRequest};
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Single backtest over the whole request range, no windowing.
pub async fn run(app: &AppContext, request: BacktestRequest, output: Option<&Path>) -> Result<()> {
    let keys = request.prepare_strategy_keys()?;
    let lookback = request.resolved_lookback(&keys);
    let symbols = unique_symbols(&keys);
    info!(
        "Backtesting {} strategy keys on {} symbols from {} to {} (lookback {})",
        keys.len(),
        symbols.len(),
        request.start_date,
        request.end_date,
        lookback
    );

    let provider = app.provider();
    let results = tokio::task::spawn_blocking(move || -> Result<_> {
        let data = provider
            .fetch(&symbols, request.start_date, request.end_date, lookback)
            .context("Failed to load prices")?;
        let results = BacktestRunner::new(&keys, &request.settings).run(
            &data,
            Some(request.start_date),
            lookback,
        )?;
        Ok(results)
    })
    .await??;

    for result in &results {
        info!(
            "{}: final capital {} ({} trades)",
            result.key,
            result
                .final_capital
                .map(|capital| format!("{:.2}", capital))
                .unwrap_or_else(|| "n/a".to_string()),
            result.trades.len()
        );
    }

    write_json(&results, output)
}
