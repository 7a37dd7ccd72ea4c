use crate::error::{EngineError, EngineResult};
use crate::indicators::{calculate_ema, calculate_rsi};
use crate::models::SignalAction;
use crate::param_utils::{get_param_usize, require_param_f64, require_param_usize, ParameterValues};
use crate::strategy::PriceHistory;

#[derive(Debug, Clone, PartialEq)]
pub struct RsiStrategy {
    period: usize,
    oversold: f64,
    overbought: f64,
    signal_smoothing: usize,
}

impl RsiStrategy {
    pub fn from_params(params: &ParameterValues) -> EngineResult<Self> {
        let period = require_param_usize(params, "period", 1)?;
        let oversold = require_param_f64(params, "oversold")?;
        let overbought = require_param_f64(params, "overbought")?;
        let signal_smoothing = get_param_usize(params, "signalSmoothing", 1).max(1);

        if !(0.0..=100.0).contains(&oversold)
            || !(0.0..=100.0).contains(&overbought)
            || oversold >= overbought
        {
            return Err(EngineError::invalid(format!(
                "rsi_reversion needs 0 <= oversold < overbought <= 100 (oversold: {}, overbought: {})",
                oversold, overbought
            )));
        }

        Ok(Self {
            period,
            oversold,
            overbought,
            signal_smoothing,
        })
    }
}

impl super::SignalEngine for RsiStrategy {
    fn name(&self) -> &'static str {
        "rsi_reversion"
    }

    fn min_history(&self) -> usize {
        self.period + self.signal_smoothing - 1
    }

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction {
        let Some(closes) = history.single() else {
            return SignalAction::Hold;
        };

        let rsi_series = calculate_rsi(&closes[..=index], self.period);
        let current = if self.signal_smoothing > 1 {
            calculate_ema(&rsi_series, self.signal_smoothing)
                .get(index)
                .copied()
                .flatten()
        } else {
            rsi_series.get(index).copied().flatten()
        };

        match current {
            Some(rsi) if rsi < self.oversold => SignalAction::Buy,
            Some(rsi) if rsi > self.overbought => SignalAction::Sell,
            _ => SignalAction::Hold,
        }
    }
}
