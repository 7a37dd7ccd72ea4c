use crate::context::AppContext;
use crate::data_context::MarketData;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::info;
use std::path::Path;

/// Re-encode a JSON bar dump (or an older snapshot) as the current binary snapshot.
pub fn convert(input_path: &Path, output_path: &Path) -> Result<()> {
    let market_data = MarketData::load_from_file(input_path)?;
    if !market_data.has_data() {
        return Err(anyhow!("{} contains no bars", input_path.display()));
    }
    market_data.save_to_file(output_path)?;
    info!(
        "Converted {} into snapshot {} ({} symbols)",
        input_path.display(),
        output_path.display(),
        market_data.symbols().len()
    );
    Ok(())
}

/// Fetch bars for `symbols` from the configured provider and store them as a
/// binary snapshot that later runs can load with `--data-file`.
pub async fn run(
    app: &AppContext,
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
    output_path: &Path,
) -> Result<()> {
    if symbols.is_empty() {
        return Err(anyhow!("At least one symbol is required to export market data"));
    }
    if end < start {
        return Err(anyhow!("End date {} is before start date {}", end, start));
    }
    info!(
        "Generating market data snapshot for {} symbols at {}",
        symbols.len(),
        output_path.display()
    );

    let provider = app.provider();
    let symbols: Vec<String> = symbols
        .iter()
        .map(|symbol| symbol.trim().to_ascii_uppercase())
        .collect();
    let bars = tokio::task::spawn_blocking(move || provider.fetch(&symbols, start, end, 0))
        .await?
        .context("Failed to load prices for export")?;

    let market_data = MarketData::from_bars(bars.into_values().flatten().collect());
    if !market_data.has_data() {
        return Err(anyhow!("No bars found between {} and {}", start, end));
    }
    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} symbols successfully written to {}",
        market_data.symbols().len(),
        output_path.display()
    );

    Ok(())
}
