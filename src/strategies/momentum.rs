use crate::error::EngineResult;
use crate::models::SignalAction;
use crate::param_utils::{require_param_usize, ParameterValues};
use crate::strategy::PriceHistory;

#[derive(Debug, Clone, PartialEq)]
pub struct MomentumStrategy {
    lookback: usize,
}

impl MomentumStrategy {
    pub fn from_params(params: &ParameterValues) -> EngineResult<Self> {
        Ok(Self {
            lookback: require_param_usize(params, "lookback", 1)?,
        })
    }
}

impl super::SignalEngine for MomentumStrategy {
    fn name(&self) -> &'static str {
        "momentum"
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

        let past = closes[index - self.lookback];
        let current = closes[index];
        if current > past {
            SignalAction::Buy
        } else if current < past {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param_utils::ParamValue;
    use crate::strategy::SignalEngine;

    #[test]
    fn compares_against_close_lookback_bars_ago() {
        let params = ParameterValues::from([("lookback".to_string(), ParamValue::Int(2))]);
        let strategy = MomentumStrategy::from_params(&params).unwrap();
        let closes = [10.0, 11.0, 12.0, 12.0, 9.0];
        let history = PriceHistory::Single(&closes);
        let signals: Vec<SignalAction> = (0..closes.len())
            .map(|i| strategy.evaluate(&history, i))
            .collect();
        assert_eq!(
            signals,
            vec![
                SignalAction::Hold,
                SignalAction::Hold,
                SignalAction::Buy,
                SignalAction::Buy,
                SignalAction::Sell
            ]
        );
        assert_eq!(strategy.min_history(), 2);
    }

    #[test]
    fn rejects_zero_lookback() {
        let params = ParameterValues::from([("lookback".to_string(), ParamValue::Int(0))]);
        assert!(MomentumStrategy::from_params(&params).is_err());
    }
}
