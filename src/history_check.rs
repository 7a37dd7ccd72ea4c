use crate::error::{EngineError, EngineResult};
use chrono::{Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrossValidationSettings {
    #[serde(rename = "minCvFolds")]
    pub min_folds: u32,
    #[serde(rename = "maxCvFolds")]
    pub max_folds: u32,
    /// Years of data in each fold; also the walk-forward window length in training.
    #[serde(rename = "foldLength")]
    pub fold_years: u32,
}

impl Default for CrossValidationSettings {
    fn default() -> Self {
        Self {
            min_folds: 2,
            max_folds: 5,
            fold_years: 1,
        }
    }
}

impl CrossValidationSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_folds == 0 || self.fold_years == 0 {
            return Err(EngineError::invalid(
                "minCvFolds and foldLength must be at least 1",
            ));
        }
        if self.max_folds < self.min_folds {
            return Err(EngineError::invalid(format!(
                "maxCvFolds ({}) must be >= minCvFolds ({})",
                self.max_folds, self.min_folds
            )));
        }
        Ok(())
    }

    /// Years of history every symbol needs before the backtest start.
    pub fn required_years(&self) -> u32 {
        self.min_folds + self.fold_years - 1
    }
}

/// History window trials are scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingPlan {
    pub folds: u32,
    pub start: NaiveDate,
    /// Day before the backtest start.
    pub end: NaiveDate,
}

fn years_before(date: NaiveDate, years: u32) -> EngineResult<NaiveDate> {
    date.checked_sub_months(Months::new(years * 12))
        .ok_or_else(|| EngineError::invalid(format!("{} years before {} is out of range", years, date)))
}

/// Check that every symbol has enough history before `backtest_start` and
/// pick the training range. Symbols absent from `first_dates` have no history.
pub fn plan_training_range(
    symbols: &[String],
    first_dates: &HashMap<String, NaiveDate>,
    backtest_start: NaiveDate,
    settings: &CrossValidationSettings,
) -> EngineResult<TrainingPlan> {
    settings.validate()?;
    let required_years = settings.required_years();
    let end = backtest_start - Duration::days(1);
    let latest_allowed_start = years_before(backtest_start, required_years)?;
    let mut earliest_common =
        years_before(backtest_start, settings.max_folds + required_years)?;

    let mut missing = Vec::new();
    for symbol in symbols {
        match first_dates.get(symbol) {
            Some(first) if *first <= latest_allowed_start => {
                earliest_common = earliest_common.max(*first);
            }
            _ => missing.push(symbol.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(EngineError::MissingCrossValidationHistory {
            symbols: missing,
            required_years,
        });
    }

    let available_years = (end - earliest_common).num_days() / 365;
    let folds = (available_years - settings.fold_years as i64 + 1)
        .clamp(1, settings.max_folds as i64) as u32;
    let start = years_before(backtest_start, folds + settings.fold_years - 1)?.max(earliest_common);

    Ok(TrainingPlan { folds, start, end })
}
