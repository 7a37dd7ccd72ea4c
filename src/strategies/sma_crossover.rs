use crate::error::{EngineError, EngineResult};
use crate::indicators::sma_at;
use crate::models::SignalAction;
use crate::param_utils::{require_param_usize, ParameterValues};
use crate::strategy::PriceHistory;

#[derive(Debug, Clone, PartialEq)]
pub struct SmaCrossoverStrategy {
    short_period: usize,
    long_period: usize,
}

impl SmaCrossoverStrategy {
    pub fn new(short_period: usize, long_period: usize) -> EngineResult<Self> {
        if short_period == 0 || long_period == 0 {
            return Err(EngineError::invalid(
                "sma_crossover periods must be at least 1",
            ));
        }
        Ok(Self {
            short_period,
            long_period,
        })
    }

    pub fn from_params(params: &ParameterValues) -> EngineResult<Self> {
        Self::new(
            require_param_usize(params, "shortPeriod", 1)?,
            require_param_usize(params, "longPeriod", 1)?,
        )
    }
}

impl super::SignalEngine for SmaCrossoverStrategy {
    fn name(&self) -> &'static str {
        "sma_crossover"
    }

    fn min_history(&self) -> usize {
        self.long_period
    }

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction {
        let Some(closes) = history.single() else {
            return SignalAction::Hold;
        };

        let short = sma_at(closes, self.short_period, index);
        let long = sma_at(closes, self.long_period, index);
        match (short, long) {
            (Some(short), Some(long)) if short > long => SignalAction::Buy,
            (Some(short), Some(long)) if short < long => SignalAction::Sell,
            _ => SignalAction::Hold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SignalEngine;

    #[test]
    fn crossover_follows_trend_direction() {
        let strategy = SmaCrossoverStrategy::new(1, 2).unwrap();
        let closes = [10.0, 11.0, 12.0, 11.0, 10.0];
        let history = PriceHistory::Single(&closes);
        let signals: Vec<SignalAction> = (0..closes.len())
            .map(|i| strategy.evaluate(&history, i))
            .collect();
        assert_eq!(
            signals,
            vec![
                SignalAction::Hold,
                SignalAction::Buy,
                SignalAction::Buy,
                SignalAction::Sell,
                SignalAction::Sell
            ]
        );
    }
}
