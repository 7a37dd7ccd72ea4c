use crate::error::{EngineError, EngineResult};
use crate::indicators::mean_and_std;
use crate::models::SignalAction;
use crate::param_utils::{require_param_f64, require_param_usize, ParameterValues};
use crate::strategy::PriceHistory;

/// Spread z-score on two aligned series.
///
/// `short` sells the first leg and buys the second, `long` does the opposite,
/// `exit` flattens both. The spread statistics use the `lookback` bars before
/// the evaluated one so the current bar never moves its own baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct PairsStrategy {
    lookback: usize,
    entry_z: f64,
    exit_z: f64,
}

impl PairsStrategy {
    pub fn from_params(params: &ParameterValues) -> EngineResult<Self> {
        let lookback = require_param_usize(params, "lookback", 2)?;
        let entry_z = require_param_f64(params, "entryZ")?;
        let exit_z = require_param_f64(params, "exitZ")?;
        if entry_z <= 0.0 || exit_z < 0.0 || exit_z > entry_z {
            return Err(EngineError::invalid(format!(
                "pairs_trading needs 0 <= exitZ <= entryZ and entryZ > 0 (entryZ: {}, exitZ: {})",
                entry_z, exit_z
            )));
        }
        Ok(Self {
            lookback,
            entry_z,
            exit_z,
        })
    }

    pub fn z_score(&self, first: &[f64], second: &[f64], index: usize) -> Option<f64> {
        if index < self.lookback || index >= first.len() || index >= second.len() {
            return None;
        }
        let spreads: Vec<f64> = (index - self.lookback..index)
            .map(|j| first[j] - second[j])
            .collect();
        let (mean, std) = mean_and_std(&spreads)?;
        let spread = first[index] - second[index];
        if std == 0.0 {
            Some(0.0)
        } else {
            Some((spread - mean) / std)
        }
    }
}

impl super::SignalEngine for PairsStrategy {
    fn name(&self) -> &'static str {
        "pairs_trading"
    }

    fn min_history(&self) -> usize {
        self.lookback
    }

    fn evaluate(&self, history: &PriceHistory<'_>, index: usize) -> SignalAction {
        let Some((first, second)) = history.pair() else {
            return SignalAction::Hold;
        };
        let Some(z) = self.z_score(first, second, index) else {
            return SignalAction::Hold;
        };

        if z > self.entry_z {
            SignalAction::Short
        } else if z < -self.entry_z {
            SignalAction::Long
        } else if z.abs() < self.exit_z {
            SignalAction::Exit
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

    fn strategy() -> PairsStrategy {
        let mut params = ParameterValues::new();
        params.insert("lookback".to_string(), ParamValue::Int(4));
        params.insert("entryZ".to_string(), ParamValue::Float(1.5));
        params.insert("exitZ".to_string(), ParamValue::Float(0.5));
        PairsStrategy::from_params(&params).unwrap()
    }

    fn series(spreads: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let second = vec![100.0; spreads.len()];
        let first = spreads.iter().map(|s| 100.0 + s).collect();
        (first, second)
    }

    #[test]
    fn signals_at_threshold_crossings() {
        let (first, second) = series(&[0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 5.0, 1.75]);
        let history = PriceHistory::Pair {
            first: &first,
            second: &second,
        };
        let strategy = strategy();
        let signals: Vec<SignalAction> = (0..first.len())
            .map(|i| strategy.evaluate(&history, i))
            .collect();

        let mut expected = vec![SignalAction::Hold; 6];
        expected.push(SignalAction::Short);
        expected.push(SignalAction::Exit);
        assert_eq!(signals, expected);
    }

    #[test]
    fn negative_spread_excursion_goes_long() {
        let (first, second) = series(&[0.0, 1.0, 0.0, 1.0, -4.0]);
        let history = PriceHistory::Pair {
            first: &first,
            second: &second,
        };
        assert_eq!(strategy().evaluate(&history, 4), SignalAction::Long);
    }

    #[test]
    fn single_series_history_is_ignored() {
        let closes = [1.0; 10];
        assert_eq!(
            strategy().evaluate(&PriceHistory::Single(&closes), 8),
            SignalAction::Hold
        );
    }
}
