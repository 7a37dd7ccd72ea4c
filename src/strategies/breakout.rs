use crate::error::{EngineError, EngineResult};
use crate::models::SignalAction;
use crate::param_utils::{require_param_f64, require_param_usize, ParameterValues};
use crate::strategy::PriceHistory;

/// Range breakout over the closes strictly before the evaluated bar.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakoutStrategy {
    lookback: usize,
    breakout_multiplier: f64,
}

impl BreakoutStrategy {
    pub fn from_params(params: &ParameterValues) -> EngineResult<Self> {
        let lookback = require_param_usize(params, "lookback", 1)?;
        let breakout_multiplier = require_param_f64(params, "breakoutMultiplier")?;
        if breakout_multiplier < 0.0 {
            return Err(EngineError::invalid(format!(
                "breakoutMultiplier must be >= 0 (value: {})",
                breakout_multiplier
            )));
        }
        Ok(Self {
            lookback,
            breakout_multiplier,
        })
    }
}

impl super::SignalEngine for BreakoutStrategy {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn min_history(&self) -> usize {
        self.lookback
    }

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction {
        let Some(closes) = history.single() else {
            return SignalAction::Hold;
        };
        if index < self.lookback {
            return SignalAction::Hold;
        }

        let window = &closes[index - self.lookback..index];
        let max_high = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_low = window.iter().copied().fold(f64::INFINITY, f64::min);
        let range = max_high - min_low;
        let price = closes[index];

        if price > max_high + self.breakout_multiplier * range {
            SignalAction::Buy
        } else if price < min_low - self.breakout_multiplier * range {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        }
    }
}
