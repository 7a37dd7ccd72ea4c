use crate::models::{SegmentOutcome, SegmentProgress, TaskRecord};
use log::warn;
use std::collections::BTreeMap;

/// Highest percentage a window can report before it has finished.
const MAX_RUNNING_PCT: f64 = 99.0;

/// Message a worker sends about the one window it owns.
#[derive(Debug, Clone)]
pub enum SegmentUpdate {
    Progress { window_id: usize, pct: f64 },
    Finished { window_id: usize, outcome: SegmentOutcome },
}

impl SegmentUpdate {
    pub fn window_id(&self) -> usize {
        match self {
            Self::Progress { window_id, .. } | Self::Finished { window_id, .. } => *window_id,
        }
    }
}

/// Per-window progress and results, fed only by worker messages.
///
/// A window's entry changes only through updates carrying its id, and once
/// finished it never changes again.
#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    progress: BTreeMap<usize, SegmentProgress>,
    results: BTreeMap<usize, SegmentOutcome>,
}

impl ProgressAggregator {
    pub fn new<I: IntoIterator<Item = usize>>(window_ids: I) -> Self {
        Self {
            progress: window_ids
                .into_iter()
                .map(|id| (id, SegmentProgress::default()))
                .collect(),
            results: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, update: SegmentUpdate) {
        let window_id = update.window_id();
        let Some(entry) = self.progress.get_mut(&window_id) else {
            warn!("Ignoring update for unknown window {}", window_id);
            return;
        };
        if entry.done {
            return;
        }

        match update {
            SegmentUpdate::Progress { pct, .. } => {
                let pct = if pct.is_finite() { pct } else { 0.0 };
                entry.progress_pct = entry.progress_pct.max(pct.clamp(0.0, MAX_RUNNING_PCT));
            }
            SegmentUpdate::Finished { outcome, .. } => {
                entry.progress_pct = 100.0;
                entry.done = true;
                self.results.insert(window_id, outcome);
            }
        }
    }

    /// Arithmetic mean of every window's latest percentage.
    pub fn overall_progress(&self) -> f64 {
        if self.progress.is_empty() {
            return 100.0;
        }
        self.progress.values().map(|p| p.progress_pct).sum::<f64>() / self.progress.len() as f64
    }

    pub fn all_done(&self) -> bool {
        self.progress.values().all(|p| p.done)
    }

    pub fn window(&self, window_id: usize) -> Option<SegmentProgress> {
        self.progress.get(&window_id).copied()
    }

    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.results
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                SegmentOutcome::Failed { message } => Some((*id, message.as_str())),
                SegmentOutcome::Completed { .. } => None,
            })
            .collect()
    }

    /// Mirror the current state into an externally visible record.
    pub fn snapshot_into(&self, record: &mut TaskRecord) {
        record.overall_progress = self.overall_progress();
        record.progress = self.progress.clone();
        record.results = self.results.clone();
    }
}
