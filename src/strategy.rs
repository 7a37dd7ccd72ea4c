use crate::error::{EngineError, EngineResult};
use crate::models::SignalAction;
use crate::param_utils::ParameterValues;

/// Close prices visible to a signal evaluation. Pair histories are already
/// aligned: index `i` refers to the same date in both series.
#[derive(Debug, Clone, Copy)]
pub enum PriceHistory<'a> {
    Single(&'a [f64]),
    Pair { first: &'a [f64], second: &'a [f64] },
}

impl<'a> PriceHistory<'a> {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(closes) => closes.len(),
            Self::Pair { first, second } => first.len().min(second.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn single(&self) -> Option<&'a [f64]> {
        match self {
            Self::Single(closes) => Some(closes),
            Self::Pair { .. } => None,
        }
    }

    pub fn pair(&self) -> Option<(&'a [f64], &'a [f64])> {
        match self {
            Self::Single(_) => None,
            Self::Pair { first, second } => Some((first, second)),
        }
    }
}

/// A pure mapping from price history and bar index to a trading action.
///
/// Implementations never see ledger state; the ledger decides whether an
/// action is actionable.
pub trait SignalEngine {
    fn name(&self) -> &'static str;

    /// Bars that must precede `index` before any non-hold action is produced.
    fn min_history(&self) -> usize;

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction;
}

#[path = "strategies/sma_crossover.rs"]
pub mod sma_crossover;

pub use sma_crossover::SmaCrossoverStrategy;

#[path = "strategies/bollinger.rs"]
pub mod bollinger;

pub use bollinger::BollingerStrategy;

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RsiStrategy;

#[path = "strategies/momentum.rs"]
pub mod momentum;

pub use momentum::MomentumStrategy;

#[path = "strategies/breakout.rs"]
pub mod breakout;

pub use breakout::BreakoutStrategy;

#[path = "strategies/pairs.rs"]
pub mod pairs;

pub use pairs::PairsStrategy;

pub const STRATEGY_NAMES: [&str; 6] = [
    "sma_crossover",
    "bollinger_reversion",
    "rsi_reversion",
    "momentum",
    "breakout",
    "pairs_trading",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    SmaCrossover(SmaCrossoverStrategy),
    Bollinger(BollingerStrategy),
    Rsi(RsiStrategy),
    Momentum(MomentumStrategy),
    Breakout(BreakoutStrategy),
    Pairs(PairsStrategy),
}

impl Strategy {
    /// Resolve a strategy name plus raw parameters into a validated variant.
    pub fn from_params(name: &str, params: &ParameterValues) -> EngineResult<Self> {
        let strategy = match name {
            "sma_crossover" => Self::SmaCrossover(SmaCrossoverStrategy::from_params(params)?),
            "bollinger_reversion" => Self::Bollinger(BollingerStrategy::from_params(params)?),
            "rsi_reversion" => Self::Rsi(RsiStrategy::from_params(params)?),
            "momentum" => Self::Momentum(MomentumStrategy::from_params(params)?),
            "breakout" => Self::Breakout(BreakoutStrategy::from_params(params)?),
            "pairs_trading" => Self::Pairs(PairsStrategy::from_params(params)?),
            other => {
                return Err(EngineError::invalid(format!(
                    "unknown strategy {} (expected one of {})",
                    other,
                    STRATEGY_NAMES.join(", ")
                )))
            }
        };
        Ok(strategy)
    }

    pub fn is_pairs(&self) -> bool {
        matches!(self, Self::Pairs(_))
    }

    /// Number of symbols a key using this strategy must name.
    pub fn legs(&self) -> usize {
        if self.is_pairs() {
            2
        } else {
            1
        }
    }

    fn engine(&self) -> &dyn SignalEngine {
        match self {
            Self::SmaCrossover(s) => s,
            Self::Bollinger(s) => s,
            Self::Rsi(s) => s,
            Self::Momentum(s) => s,
            Self::Breakout(s) => s,
            Self::Pairs(s) => s,
        }
    }
}

impl SignalEngine for Strategy {
    fn name(&self) -> &'static str {
        self.engine().name()
    }

    fn min_history(&self) -> usize {
        self.engine().min_history()
    }

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction {
        if index >= history.len() || index < self.min_history() {
            return SignalAction::Hold;
        }
        self.engine().evaluate(history, index)
    }
}
