use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key used for the synthetic portfolio-level curve produced by every run.
pub const OVERALL_KEY: &str = "overall";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub high: f64,
    #[serde(default)]
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl PriceBar {
    /// A bar is only tradable when its close is a positive finite number.
    pub fn has_price(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Hold,
    Buy,
    Sell,
    Long,
    Short,
    Exit,
}

impl SignalAction {
    pub fn is_entry(self) -> bool {
        matches!(self, Self::Buy | Self::Long | Self::Short)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, Self::Sell | Self::Exit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Long,
    Short,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub return_pct: f64,
    /// Entry plus exit commission paid on this leg.
    pub costs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub id: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub mean_return: f64,
    pub cagr: f64,
    pub annualised_volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeStats {
    pub num_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: Option<f64>,
    pub best_trade: Trade,
    pub worst_trade: Trade,
}

/// Output of one backtest run for a single strategy key (or the overall curve).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub key: String,
    pub symbol: String,
    pub strategy: String,
    pub initial_capital: f64,
    pub final_capital: Option<f64>,
    pub return_pct: Option<f64>,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub metrics: Option<PerformanceMetrics>,
    pub trade_stats: Option<TradeStats>,
}

impl StrategyResult {
    pub fn is_overall(&self) -> bool {
        self.key == OVERALL_KEY
    }
}

/// Everything one window produced, in key order with the overall curve last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentResult {
    pub window: Window,
    pub results: Vec<StrategyResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SegmentOutcome {
    Completed { result: SegmentResult },
    Failed { message: String },
}

impl SegmentOutcome {
    pub fn completed(&self) -> Option<&SegmentResult> {
        match self {
            Self::Completed { result } => Some(result),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { message } => Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentProgress {
    pub progress_pct: f64,
    pub done: bool,
}

impl Default for SegmentProgress {
    fn default() -> Self {
        Self {
            progress_pct: 0.0,
            done: false,
        }
    }
}

/// One stitched record per (symbol, strategy) per slide of consecutive segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardRecord {
    pub symbol: String,
    pub strategy: String,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub metrics: Option<PerformanceMetrics>,
    pub trade_stats: Option<TradeStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyReturn {
    pub date: NaiveDate,
    pub value: f64,
    #[serde(rename = "return")]
    pub daily_return: f64,
}

/// Cross-slide summary for one (symbol, strategy) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub symbol: String,
    pub strategy: String,
    pub segments: usize,
    pub active_segments: usize,
    pub no_trade_segments: usize,
    pub avg_sharpe: Option<f64>,
    #[serde(rename = "avgCAGR")]
    pub avg_cagr: Option<f64>,
    pub avg_max_drawdown: Option<f64>,
    pub avg_win_rate: Option<f64>,
    pub returns: Option<Vec<DailyReturn>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Externally visible state of one walk-forward task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub overall_progress: f64,
    pub progress: BTreeMap<usize, SegmentProgress>,
    pub results: BTreeMap<usize, SegmentOutcome>,
    pub total_segments: usize,
    pub window_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_results: Option<Vec<AggregatedResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn pending(total_segments: usize, window_length: usize) -> Self {
        Self {
            status: TaskStatus::Pending,
            overall_progress: 0.0,
            progress: BTreeMap::new(),
            results: BTreeMap::new(),
            total_segments,
            window_length,
            aggregated_results: None,
            error: None,
        }
    }

    /// Completed segments in window-start order.
    pub fn completed_segments(&self) -> Vec<SegmentResult> {
        let mut segments: Vec<SegmentResult> = self
            .results
            .values()
            .filter_map(|outcome| outcome.completed().cloned())
            .collect();
        segments.sort_by_key(|segment| (segment.window.start, segment.window.id));
        segments
    }
}
