use crate::models::TaskStatus;
use crate::param_utils::ParameterValues;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Progress of one strategy's parameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyProgress {
    pub total_trials: usize,
    pub completed_trials: usize,
    pub failed_trials: usize,
    pub status: TaskStatus,
    pub best_score: Option<f64>,
    pub best_params: Option<ParameterValues>,
}

impl StrategyProgress {
    fn new(total_trials: usize) -> Self {
        Self {
            total_trials,
            completed_trials: 0,
            failed_trials: 0,
            status: TaskStatus::Pending,
            best_score: None,
            best_params: None,
        }
    }
}

/// Shared status board keyed by strategy name; every study writes only its own entry.
#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<BTreeMap<String, StrategyProgress>>>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, strategy: &str, total_trials: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.insert(strategy.to_string(), StrategyProgress::new(total_trials));
        }
    }

    pub fn set_status(&self, strategy: &str, status: TaskStatus) {
        if let Ok(mut data) = self.inner.lock() {
            if let Some(entry) = data.get_mut(strategy) {
                entry.status = status;
            }
        }
    }

    /// Count a finished trial; failed trials never become the best.
    pub fn record_trial(&self, strategy: &str, score: f64, params: &ParameterValues, failed: bool) {
        if let Ok(mut data) = self.inner.lock() {
            let Some(entry) = data.get_mut(strategy) else {
                return;
            };
            entry.completed_trials += 1;
            if failed {
                entry.failed_trials += 1;
                return;
            }
            if entry.best_score.map_or(true, |best| score > best) {
                entry.best_score = Some(score);
                entry.best_params = Some(params.clone());
            }
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, StrategyProgress> {
        self.inner
            .lock()
            .map(|data| data.clone())
            .unwrap_or_default()
    }

    pub fn all_finished(&self) -> bool {
        let snapshot = self.snapshot();
        !snapshot.is_empty() && snapshot.values().all(|entry| entry.status.is_terminal())
    }
}
