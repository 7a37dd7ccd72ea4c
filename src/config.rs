use crate::error::{EngineError, EngineResult};
use crate::ledger::TradingCosts;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const SETTINGS_ENV_PREFIX: &str = "WALKFORWARD_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FillTiming {
    /// Orders decided on a bar's close fill at the next bar's close.
    #[default]
    NextBar,
    /// Orders fill at the close of the bar that produced them.
    SameBar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebalanceFrequency {
    /// Position size is only decided when a position is opened.
    #[default]
    OnSignal,
}

/// Trading assumptions shared by every strategy key in a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BacktestSettings {
    pub initial_capital: f64,
    /// Percent per fill (0.1 == 0.1%).
    pub slippage: f64,
    /// Percent per fill.
    pub transaction_cost_pct: f64,
    pub fixed_transaction_cost: f64,
    pub min_holding_period: usize,
    /// Annualised volatility target in percent; `None` invests all available capital.
    pub vol_target: Option<f64>,
    pub vol_lookback: usize,
    pub rebalance_frequency: RebalanceFrequency,
    pub fill_timing: FillTiming,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            slippage: 0.0,
            transaction_cost_pct: 0.0,
            fixed_transaction_cost: 0.0,
            min_holding_period: 0,
            vol_target: None,
            vol_lookback: 20,
            rebalance_frequency: RebalanceFrequency::OnSignal,
            fill_timing: FillTiming::NextBar,
        }
    }
}

impl BacktestSettings {
    pub fn validate(&self) -> EngineResult<()> {
        let non_negative = [
            ("slippage", self.slippage),
            ("transactionCostPct", self.transaction_cost_pct),
            ("fixedTransactionCost", self.fixed_transaction_cost),
        ];
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(EngineError::invalid(format!(
                "initialCapital must be a positive number (value: {})",
                self.initial_capital
            )));
        }
        for (key, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::invalid(format!(
                    "{} must be >= 0 (value: {})",
                    key, value
                )));
            }
        }
        if self.slippage >= 100.0 || self.transaction_cost_pct >= 100.0 {
            return Err(EngineError::invalid(
                "slippage and transactionCostPct must be below 100%",
            ));
        }
        if let Some(target) = self.vol_target {
            if !target.is_finite() || target <= 0.0 {
                return Err(EngineError::invalid(format!(
                    "volTarget must be a positive percentage (value: {})",
                    target
                )));
            }
            if self.vol_lookback < 2 {
                return Err(EngineError::invalid(format!(
                    "volLookback must be >= 2 when volTarget is set (value: {})",
                    self.vol_lookback
                )));
            }
        }
        Ok(())
    }

    pub fn trading_costs(&self) -> TradingCosts {
        TradingCosts {
            slippage: self.slippage / 100.0,
            commission_pct: self.transaction_cost_pct / 100.0,
            commission_fixed: self.fixed_transaction_cost,
        }
    }

    pub fn vol_target_fraction(&self) -> Option<f64> {
        self.vol_target.map(|target| target / 100.0)
    }
}

/// Process-level knobs: worker pool size, polling cadence, window geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub window_years: u32,
    pub stitch_length: usize,
    pub price_api_url: Option<String>,
    pub price_api_timeout: Duration,
    pub local_search_step_multipliers: Vec<f64>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            poll_interval: Duration::from_millis(300),
            window_years: 1,
            stitch_length: 3,
            price_api_url: None,
            price_api_timeout: Duration::from_secs(30),
            local_search_step_multipliers: vec![-2.0, -1.0, 1.0, 2.0],
        }
    }
}

pub fn default_worker_count() -> usize {
    std::cmp::max(1, num_cpus::get().saturating_sub(1))
}

impl RuntimeSettings {
    /// Read `WALKFORWARD_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(SETTINGS_ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect();
        Self::from_settings_map(&settings)
    }

    /// Every key is optional; present keys must parse and respect their bounds.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let workers = optional_setting_usize(settings, "WORKERS", 1)?.unwrap_or(defaults.workers);
        let poll_interval = optional_setting_usize(settings, "POLL_INTERVAL_MS", 10)?
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(defaults.poll_interval);
        let window_years = optional_setting_usize(settings, "WINDOW_YEARS", 1)?
            .map(|years| years as u32)
            .unwrap_or(defaults.window_years);
        let stitch_length = optional_setting_usize(settings, "STITCH_LENGTH", 1)?
            .unwrap_or(defaults.stitch_length);
        let price_api_url = optional_setting(settings, "PRICE_API_URL").map(str::to_string);
        let price_api_timeout = optional_setting_f64(settings, "PRICE_API_TIMEOUT_SECS", Some(1.0), None)?
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.price_api_timeout);
        let local_search_step_multipliers =
            match optional_setting(settings, "LOCAL_SEARCH_STEP_MULTIPLIERS") {
                Some(_) => require_setting_f64_list(settings, "LOCAL_SEARCH_STEP_MULTIPLIERS")?,
                None => defaults.local_search_step_multipliers,
            };

        if window_years > 50 {
            return Err(anyhow!(
                "Setting WINDOW_YEARS must be <= 50 (value: {})",
                window_years
            ));
        }

        Ok(Self {
            workers,
            poll_interval,
            window_years,
            stitch_length,
            price_api_url,
            price_api_timeout,
            local_search_step_multipliers,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>> {
    let Some(value) = optional_setting_f64(settings, key, None, None)? else {
        return Ok(None);
    };
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            value
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            value
        ));
    }
    Ok(Some(value as usize))
}

fn require_setting_f64_list(settings: &HashMap<String, String>, key: &str) -> Result<Vec<f64>> {
    let raw = require_setting(settings, key)?;
    let trimmed = raw.trim().trim_matches(|c| c == '[' || c == ']');
    let mut values = Vec::new();

    for part in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        let value = entry
            .parse::<f64>()
            .map_err(|_| anyhow!("Setting {} must be a list of numbers (value: {})", key, raw))?;
        if !value.is_finite() {
            return Err(anyhow!(
                "Setting {} must contain only finite numbers (value: {})",
                key,
                raw
            ));
        }
        values.push(value);
    }

    if values.is_empty() {
        return Err(anyhow!(
            "Setting {} must contain at least one number (value: {})",
            key,
            raw
        ));
    }

    Ok(values)
}
