use thiserror::Error;

/// Domain failures surfaced by the backtesting pipeline.
///
/// Glue code (files, HTTP, CLI) keeps using `anyhow`; these variants are the
/// ones callers are expected to match on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient data for {symbol}: {message}")]
    InsufficientData { symbol: String, message: String },

    #[error(
        "not enough history before the start date: {required_years} years required for {}",
        symbols.join(", ")
    )]
    MissingCrossValidationHistory {
        symbols: Vec<String>,
        required_years: u32,
    },

    #[error("window {window_id} failed: {message}")]
    SegmentExecution { window_id: usize, message: String },

    #[error("trial {trial} failed: {message}")]
    OptimizationTrial { trial: usize, message: String },

    #[error("task was cancelled")]
    Cancelled,

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("price provider error: {0}")]
    Provider(String),
}

impl EngineError {
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest(message.into())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
