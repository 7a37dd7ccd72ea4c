use crate::config::BacktestSettings;
use crate::error::{EngineError, EngineResult};
use crate::param_utils::ParameterValues;
use crate::strategy::{SignalEngine, Strategy};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

fn default_weight() -> f64 {
    1.0
}

/// One line of a request: a symbol (or `A-B` pair) traded by one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolItem {
    pub symbol: String,
    pub strategy: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub params: ParameterValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub symbols: Vec<SymbolItem>,
    #[serde(default)]
    pub settings: BacktestSettings,
    /// Parameters shared by every item using the named strategy; item params win.
    #[serde(default)]
    pub strategy_params: BTreeMap<String, ParameterValues>,
    /// Warm-up bars fetched before each window; derived from the strategies when absent.
    #[serde(default)]
    pub lookback: Option<usize>,
    #[serde(default)]
    pub window_years: Option<u32>,
    /// Consecutive segments stitched per walk-forward slide.
    #[serde(default)]
    pub window_length: Option<usize>,
}

/// A validated (symbol set, strategy, weight) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyKey {
    pub id: String,
    pub symbol: String,
    pub legs: Vec<String>,
    pub strategy: Strategy,
    pub weight: f64,
}

impl BacktestRequest {
    /// Shape checks that must pass before anything is scheduled.
    pub fn validate(&self) -> EngineResult<()> {
        if self.symbols.is_empty() {
            return Err(EngineError::invalid("symbols must not be empty"));
        }
        if self.end_date <= self.start_date {
            return Err(EngineError::invalid(format!(
                "endDate {} must be after startDate {}",
                self.end_date, self.start_date
            )));
        }
        if self.window_years == Some(0) {
            return Err(EngineError::invalid("windowYears must be at least 1"));
        }
        if self.window_length == Some(0) {
            return Err(EngineError::invalid("windowLength must be at least 1"));
        }
        self.settings.validate()
    }

    /// Validate the request and resolve every item into a strategy key.
    pub fn prepare_strategy_keys(&self) -> EngineResult<Vec<StrategyKey>> {
        self.validate()?;

        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(self.symbols.len());
        for item in &self.symbols {
            let symbol = item.symbol.trim().to_ascii_uppercase();
            if symbol.is_empty() {
                return Err(EngineError::invalid("symbol must not be blank"));
            }
            if !item.weight.is_finite() || item.weight <= 0.0 {
                return Err(EngineError::invalid(format!(
                    "weight for {} must be positive (value: {})",
                    symbol, item.weight
                )));
            }

            let mut params = self
                .strategy_params
                .get(&item.strategy)
                .cloned()
                .unwrap_or_default();
            params.extend(item.params.clone());
            let strategy = Strategy::from_params(&item.strategy, &params).map_err(|err| {
                EngineError::invalid(format!("{} ({}): {}", symbol, item.strategy, err))
            })?;

            let legs: Vec<String> = symbol.split('-').map(|s| s.trim().to_string()).collect();
            if legs.len() != strategy.legs() || legs.iter().any(String::is_empty) {
                return Err(EngineError::invalid(format!(
                    "{} expects {} symbol(s), got {}",
                    item.strategy,
                    strategy.legs(),
                    symbol
                )));
            }

            let id = format!("{}_{}", symbol, strategy.name());
            if !seen.insert(id.clone()) {
                return Err(EngineError::invalid(format!("duplicate strategy key {}", id)));
            }

            keys.push(StrategyKey {
                id,
                symbol,
                legs,
                strategy,
                weight: item.weight,
            });
        }

        Ok(keys)
    }

    /// Warm-up bars needed so every key can signal from the first trading day.
    pub fn resolved_lookback(&self, keys: &[StrategyKey]) -> usize {
        if let Some(lookback) = self.lookback {
            return lookback;
        }
        let strategy_warm_up = keys
            .iter()
            .map(|key| key.strategy.min_history())
            .max()
            .unwrap_or(0);
        let sizing_warm_up = if self.settings.vol_target.is_some() {
            self.settings.vol_lookback
        } else {
            0
        };
        strategy_warm_up.max(sizing_warm_up)
    }

    /// Copy of this request with `params` layered over every item of `strategy`.
    pub fn with_strategy_params(&self, strategy: &str, params: &ParameterValues) -> Self {
        let mut request = self.clone();
        for item in request
            .symbols
            .iter_mut()
            .filter(|item| item.strategy == strategy)
        {
            item.params.extend(params.clone());
        }
        request
    }

    /// Every individual symbol the request names, pair legs included, sorted.
    pub fn symbol_universe(&self) -> Vec<String> {
        self.symbols
            .iter()
            .flat_map(|item| item.symbol.split('-'))
            .map(|symbol| symbol.trim().to_ascii_uppercase())
            .filter(|symbol| !symbol.is_empty())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    }

    /// Copy of this request restricted to the items using `strategy`.
    pub fn only_strategy(&self, strategy: &str) -> Self {
        let mut request = self.clone();
        request.symbols.retain(|item| item.strategy == strategy);
        request
    }
}

pub fn unique_symbols(keys: &[StrategyKey]) -> Vec<String> {
    keys.iter()
        .flat_map(|key| key.legs.iter().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(symbols: serde_json::Value) -> BacktestRequest {
        serde_json::from_value(json!({
            "startDate": "2020-01-01",
            "endDate": "2022-01-01",
            "symbols": symbols,
            "strategyParams": {
                "momentum": {"lookback": 5},
                "pairs_trading": {"lookback": 10, "entryZ": 2.0, "exitZ": 0.5}
            }
        }))
        .unwrap()
    }

    #[test]
    fn builds_keys_with_shared_and_item_params() {
        let request = request(json!([
            {"symbol": "aapl", "strategy": "momentum", "weight": 0.5},
            {"symbol": "MSFT", "strategy": "momentum", "weight": 0.25, "params": {"lookback": 30}},
            {"symbol": "KO-PEP", "strategy": "pairs_trading", "weight": 0.25}
        ]));
        let keys = request.prepare_strategy_keys().unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].id, "AAPL_momentum");
        assert_eq!(keys[2].legs, vec!["KO".to_string(), "PEP".to_string()]);
        assert_eq!(request.resolved_lookback(&keys), 30);
        assert_eq!(
            unique_symbols(&keys),
            vec!["AAPL", "KO", "MSFT", "PEP"]
        );
    }

    #[test]
    fn fails_fast_on_malformed_requests() {
        assert!(request(json!([])).prepare_strategy_keys().is_err());
        assert!(request(json!([{"symbol": "KO", "strategy": "pairs_trading"}]))
            .prepare_strategy_keys()
            .is_err());
        assert!(request(json!([{"symbol": "KO", "strategy": "sma_crossover"}]))
            .prepare_strategy_keys()
            .is_err());
        assert!(request(json!([
            {"symbol": "KO", "strategy": "momentum"},
            {"symbol": "ko", "strategy": "momentum"}
        ]))
        .prepare_strategy_keys()
        .is_err());

        let mut inverted = request(json!([{"symbol": "KO", "strategy": "momentum"}]));
        inverted.end_date = inverted.start_date;
        assert!(inverted.prepare_strategy_keys().is_err());
    }

    #[test]
    fn trial_params_override_item_params() {
        let request = request(json!([
            {"symbol": "KO", "strategy": "momentum", "params": {"lookback": 3}}
        ]));
        let mut trial = ParameterValues::new();
        trial.insert("lookback".to_string(), crate::param_utils::ParamValue::Int(12));
        let keys = request
            .with_strategy_params("momentum", &trial)
            .prepare_strategy_keys()
            .unwrap();
        assert_eq!(keys[0].strategy.min_history(), 12);
    }
}
