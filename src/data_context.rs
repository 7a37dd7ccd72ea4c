use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Source of ordered daily bars.
///
/// `fetch` returns every requested symbol: bars inside `[start, end]` plus up to
/// `lookback` bars immediately before `start`, ascending by date. A symbol the
/// source does not know maps to an empty series instead of an error.
pub trait PriceSeriesProvider: Send + Sync {
    fn fetch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        lookback: usize,
    ) -> Result<HashMap<String, Vec<PriceBar>>>;

    /// First date with a bar for each symbol; used to plan training history.
    fn first_dates(&self, symbols: &[String]) -> Result<HashMap<String, NaiveDate>>;
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: chrono::DateTime<Utc>,
    bars: Vec<PriceBar>,
}

/// In-memory bar store, shared by reference between workers.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    bars_by_symbol: Arc<BTreeMap<String, Vec<PriceBar>>>,
}

impl MarketData {
    pub fn from_bars(bars: Vec<PriceBar>) -> Self {
        let mut bars_by_symbol: BTreeMap<String, Vec<PriceBar>> = BTreeMap::new();
        for mut bar in bars {
            bar.symbol = bar.symbol.trim().to_ascii_uppercase();
            bars_by_symbol.entry(bar.symbol.clone()).or_default().push(bar);
        }
        for series in bars_by_symbol.values_mut() {
            series.sort_by_key(|bar| bar.date);
            series.dedup_by_key(|bar| bar.date);
        }
        Self {
            bars_by_symbol: Arc::new(bars_by_symbol),
        }
    }

    /// Load a snapshot: `.json` files hold a plain bar array, anything else is
    /// the versioned binary format written by [`MarketData::save_to_file`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open market data at {}", path.display()))?;
        let reader = BufReader::new(file);

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let bars: Vec<PriceBar> = if is_json {
            serde_json::from_reader(reader)
                .with_context(|| format!("Invalid JSON bar list in {}", path.display()))?
        } else {
            let snapshot: MarketDataSnapshot =
                bincode::deserialize_from(reader).context("Snapshot decode failed")?;
            if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
                return Err(anyhow!(
                    "Market data snapshot version mismatch (found {}, expected {})",
                    snapshot.version,
                    MARKET_DATA_SNAPSHOT_VERSION
                ));
            }
            snapshot.bars
        };

        let data = Self::from_bars(bars);
        info!(
            "Loaded {} symbols from {}",
            data.symbols().len(),
            path.display()
        );
        Ok(data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            bars: self.bars_by_symbol.values().flatten().cloned().collect(),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.bars_by_symbol.values().any(|bars| !bars.is_empty())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.bars_by_symbol.keys().cloned().collect()
    }

    pub fn bars(&self, symbol: &str) -> &[PriceBar] {
        self.bars_by_symbol
            .get(symbol)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn slice(&self, symbol: &str, start: NaiveDate, end: NaiveDate, lookback: usize) -> Vec<PriceBar> {
        let bars = self.bars(symbol);
        let first_in_range = bars.partition_point(|bar| bar.date < start);
        let past_end = bars.partition_point(|bar| bar.date <= end);
        let from = first_in_range.saturating_sub(lookback);
        if from >= past_end {
            return Vec::new();
        }
        bars[from..past_end].to_vec()
    }
}

impl PriceSeriesProvider for MarketData {
    fn fetch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        lookback: usize,
    ) -> Result<HashMap<String, Vec<PriceBar>>> {
        if start > end {
            return Err(anyhow!(
                "Invalid market data date range: {} is after {}",
                start,
                end
            ));
        }
        Ok(symbols
            .iter()
            .map(|symbol| (symbol.clone(), self.slice(symbol, start, end, lookback)))
            .collect())
    }

    fn first_dates(&self, symbols: &[String]) -> Result<HashMap<String, NaiveDate>> {
        Ok(symbols
            .iter()
            .filter_map(|symbol| {
                self.bars(symbol)
                    .first()
                    .map(|bar| (symbol.clone(), bar.date))
            })
            .collect())
    }
}
