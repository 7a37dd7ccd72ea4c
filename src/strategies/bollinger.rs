use crate::error::{EngineError, EngineResult};
use crate::indicators::bollinger_at;
use crate::models::SignalAction;
use crate::param_utils::{require_param_f64, require_param_usize, ParameterValues};
use crate::strategy::PriceHistory;

/// Mean reversion against Bollinger bands: buy below the lower band, sell above the upper.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerStrategy {
    period: usize,
    band_multiplier: f64,
}

impl BollingerStrategy {
    pub fn from_params(params: &ParameterValues) -> EngineResult<Self> {
        let period = require_param_usize(params, "period", 2)?;
        let band_multiplier = require_param_f64(params, "bandMultiplier")?;
        if band_multiplier < 0.0 {
            return Err(EngineError::invalid(format!(
                "bandMultiplier must be >= 0 (value: {})",
                band_multiplier
            )));
        }
        Ok(Self {
            period,
            band_multiplier,
        })
    }
}

impl super::SignalEngine for BollingerStrategy {
    fn name(&self) -> &'static str {
        "bollinger_reversion"
    }

    fn min_history(&self) -> usize {
        self.period - 1
    }

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction {
        let Some(closes) = history.single() else {
            return SignalAction::Hold;
        };
        let Some((lower, _, upper)) = bollinger_at(closes, self.period, self.band_multiplier, index)
        else {
            return SignalAction::Hold;
        };

        let price = closes[index];
        if price < lower {
            SignalAction::Buy
        } else if price > upper {
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
    fn trades_band_excursions() {
        let mut params = ParameterValues::new();
        params.insert("period".to_string(), ParamValue::Int(5));
        params.insert("bandMultiplier".to_string(), ParamValue::Float(1.0));
        let strategy = BollingerStrategy::from_params(&params).unwrap();

        let closes = [10.0, 10.0, 10.0, 10.0, 6.0, 10.0, 10.0, 10.0, 14.0];
        let history = PriceHistory::Single(&closes);
        assert_eq!(strategy.evaluate(&history, 4), SignalAction::Buy);
        assert_eq!(strategy.evaluate(&history, 8), SignalAction::Sell);
        assert_eq!(strategy.evaluate(&history, 3), SignalAction::Hold);
    }
}
