use crate::config::{BacktestSettings, RuntimeSettings};
use crate::data_context::PriceSeriesProvider;
use crate::engine::BacktestRunner;
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use crate::progress::{ProgressAggregator, SegmentUpdate};
use crate::request::{unique_symbols, BacktestRequest, StrategyKey};
use crate::task_store::TaskStore;
use crate::walkforward::{aggregate_walkforward_results, compute_walkforward_results};
use crate::windows::generate_windows;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use log::{info, warn};
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cooperative stop signal shared by a task's coordinator and workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the workers need to run every window of one walk-forward task.
#[derive(Debug, Clone)]
pub struct WalkForwardJob {
    pub keys: Vec<StrategyKey>,
    pub settings: BacktestSettings,
    pub windows: Vec<Window>,
    pub lookback: usize,
    pub window_length: usize,
}

impl WalkForwardJob {
    pub fn from_request(request: &BacktestRequest, runtime: &RuntimeSettings) -> EngineResult<Self> {
        let keys = request.prepare_strategy_keys()?;
        let window_years = request.window_years.unwrap_or(runtime.window_years);
        let windows = generate_windows(request.start_date, request.end_date, window_years)?;
        let window_length = request.window_length.unwrap_or(runtime.stitch_length);
        if windows.len() < window_length {
            return Err(EngineError::invalid(format!(
                "{} to {} gives {} window(s) of {} year(s), fewer than the {} stitched per slide",
                request.start_date,
                request.end_date,
                windows.len(),
                window_years,
                window_length
            )));
        }
        Ok(Self {
            lookback: request.resolved_lookback(&keys),
            window_length,
            settings: request.settings.clone(),
            keys,
            windows,
        })
    }
}

/// Fans windows out to a bounded pool of worker threads and mirrors their
/// progress into the task store from a single coordinator.
#[derive(Clone)]
pub struct WindowScheduler {
    provider: Arc<dyn PriceSeriesProvider>,
    store: TaskStore,
    workers: usize,
    poll_interval: Duration,
}

impl WindowScheduler {
    pub fn new(
        provider: Arc<dyn PriceSeriesProvider>,
        store: TaskStore,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            workers: workers.max(1),
            poll_interval,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn provider(&self) -> Arc<dyn PriceSeriesProvider> {
        Arc::clone(&self.provider)
    }

    /// Register the task and run it in the background. Must be called inside a
    /// Tokio runtime.
    pub fn spawn(&self, job: WalkForwardJob) -> Uuid {
        let (id, cancel) = self
            .store
            .create(TaskRecord::pending(job.windows.len(), job.window_length));
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.coordinate(id, job, cancel).await });
        id
    }

    /// Run the task to its terminal state and return the final record.
    pub async fn run_to_completion(&self, job: WalkForwardJob) -> EngineResult<TaskRecord> {
        let (id, cancel) = self
            .store
            .create(TaskRecord::pending(job.windows.len(), job.window_length));
        self.coordinate(id, job, cancel).await;
        self.store
            .remove(&id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    async fn coordinate(&self, id: Uuid, job: WalkForwardJob, cancel: CancellationFlag) {
        let started = Instant::now();
        let job = Arc::new(job);
        let window_count = job.windows.len();
        let worker_count = self.workers.min(window_count).max(1);
        info!(
            "Task {}: running {} windows on {} workers ({} strategy keys, lookback {})",
            id,
            window_count,
            worker_count,
            job.keys.len(),
            job.lookback
        );

        let (task_tx, task_rx): (Sender<Window>, Receiver<Window>) = bounded(window_count.max(1));
        let (update_tx, update_rx): (Sender<SegmentUpdate>, Receiver<SegmentUpdate>) = unbounded();

        let mut handles = Vec::with_capacity(worker_count);
        for _worker_id in 0..worker_count {
            let task_rx = task_rx.clone();
            let update_tx = update_tx.clone();
            let provider = Arc::clone(&self.provider);
            let job = Arc::clone(&job);
            let cancel = cancel.clone();

            handles.push(thread::spawn(move || {
                while let Ok(window) = task_rx.recv() {
                    let outcome = execute_window(provider.as_ref(), &job, window, &cancel, &update_tx);
                    let finished = SegmentUpdate::Finished {
                        window_id: window.id,
                        outcome,
                    };
                    if update_tx.send(finished).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(task_rx);
        drop(update_tx);

        for window in &job.windows {
            if let Err(err) = task_tx.send(*window) {
                warn!("Task {}: could not queue window {}: {}", id, window.id, err);
            }
        }
        drop(task_tx);

        let mut aggregator = ProgressAggregator::new(job.windows.iter().map(|w| w.id));
        let mut record = TaskRecord::pending(window_count, job.window_length);
        record.status = TaskStatus::Running;
        self.publish(&id, record.clone());

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let mut disconnected = false;
            loop {
                match update_rx.try_recv() {
                    Ok(update) => aggregator.apply(update),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            aggregator.snapshot_into(&mut record);
            if aggregator.all_done() || disconnected {
                break;
            }
            self.publish(&id, record.clone());
        }

        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("A window worker exited abnormally");
                }
            }
        })
        .await;
        if let Err(err) = joined {
            warn!("Task {}: joining workers failed: {}", id, err);
        }

        self.finish(&id, &aggregator, record, &cancel).await;
        info!(
            "Task {} finished in {:.1}s",
            id,
            started.elapsed().as_secs_f64()
        );
    }

    async fn finish(
        &self,
        id: &Uuid,
        aggregator: &ProgressAggregator,
        mut record: TaskRecord,
        cancel: &CancellationFlag,
    ) {
        let failures = aggregator.failures();
        if !aggregator.all_done() {
            record.status = TaskStatus::Failed;
            record.error = Some("workers stopped before every window finished".to_string());
        } else if cancel.is_cancelled() && !failures.is_empty() {
            record.status = TaskStatus::Cancelled;
            record.error = Some(EngineError::Cancelled.to_string());
        } else if !failures.is_empty() {
            let details: Vec<String> = failures
                .iter()
                .map(|(window_id, message)| format!("window {}: {}", window_id, message))
                .collect();
            record.status = TaskStatus::Failed;
            record.error = Some(format!(
                "{} of {} windows failed ({})",
                failures.len(),
                record.total_segments,
                details.join("; ")
            ));
        } else {
            let segments = record.completed_segments();
            let window_length = record.window_length;
            let aggregated = tokio::task::spawn_blocking(move || {
                let slides = compute_walkforward_results(&segments, window_length);
                aggregate_walkforward_results(&slides)
            })
            .await;
            match aggregated {
                Ok(aggregated) => {
                    record.status = TaskStatus::Done;
                    record.aggregated_results = Some(aggregated);
                }
                Err(err) => {
                    record.status = TaskStatus::Failed;
                    record.error = Some(format!("aggregation failed: {}", err));
                }
            }
        }

        match record.status {
            TaskStatus::Done => info!("Task {}: all {} windows done", id, record.total_segments),
            status => warn!(
                "Task {} ended as {:?}: {}",
                id,
                status,
                record.error.as_deref().unwrap_or("")
            ),
        }
        self.publish(id, record);
    }

    fn publish(&self, id: &Uuid, record: TaskRecord) {
        if let Err(err) = self.store.publish(id, record) {
            warn!("Could not publish task {}: {}", id, err);
        }
    }
}

/// Run one window behind the worker boundary: errors and panics both become
/// a failed outcome instead of unwinding into the pool.
fn execute_window(
    provider: &dyn PriceSeriesProvider,
    job: &WalkForwardJob,
    window: Window,
    cancel: &CancellationFlag,
    updates: &Sender<SegmentUpdate>,
) -> SegmentOutcome {
    if cancel.is_cancelled() {
        return SegmentOutcome::Failed {
            message: EngineError::Cancelled.to_string(),
        };
    }

    let started = Instant::now();
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        run_window(provider, job, window, cancel, updates)
    }));
    let elapsed = started.elapsed().as_secs_f64();

    match run {
        Ok(Ok(result)) => {
            if let Some(metrics) = result
                .results
                .iter()
                .find(|r| r.is_overall())
                .and_then(|r| r.metrics.as_ref())
            {
                info!(
                    "Window {} ({} to {}) finished in {:.2}s. CAGR: {:.2}%, Sharpe: {:.4}",
                    window.id, window.start, window.end, elapsed, metrics.cagr, metrics.sharpe_ratio
                );
            } else {
                info!("Window {} finished in {:.2}s without metrics", window.id, elapsed);
            }
            SegmentOutcome::Completed { result }
        }
        Ok(Err(EngineError::Cancelled)) => SegmentOutcome::Failed {
            message: EngineError::Cancelled.to_string(),
        },
        Ok(Err(err)) => {
            let err = EngineError::SegmentExecution {
                window_id: window.id,
                message: err.to_string(),
            };
            warn!("{} after {:.2}s", err, elapsed);
            SegmentOutcome::Failed {
                message: err.to_string(),
            }
        }
        Err(payload) => {
            let err = EngineError::SegmentExecution {
                window_id: window.id,
                message: format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!("{}", err);
            SegmentOutcome::Failed {
                message: err.to_string(),
            }
        }
    }
}

fn run_window(
    provider: &dyn PriceSeriesProvider,
    job: &WalkForwardJob,
    window: Window,
    cancel: &CancellationFlag,
    updates: &Sender<SegmentUpdate>,
) -> EngineResult<SegmentResult> {
    let symbols = unique_symbols(&job.keys);
    let data = provider
        .fetch(&symbols, window.start, window.end, job.lookback)
        .map_err(|err| EngineError::Provider(format!("{:#}", err)))?;

    let runner = BacktestRunner::new(&job.keys, &job.settings);
    let mut last_reported = 0.0;
    let results = runner.run_with_progress(&data, Some(window.start), job.lookback, |done, total| {
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        let pct = done as f64 / total.max(1) as f64 * 100.0;
        if pct - last_reported >= 1.0 {
            last_reported = pct;
            // The coordinator may already be gone; progress is best effort.
            let _ = updates.send(SegmentUpdate::Progress {
                window_id: window.id,
                pct,
            });
        }
        ControlFlow::Continue(())
    })?;

    Ok(SegmentResult { window, results })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
