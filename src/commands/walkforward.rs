use crate::commands::{progress_bar, write_json};
use crate::context::AppContext;
use crate::models::TaskStatus;
use crate::request::BacktestRequest;
use crate::scheduler::WalkForwardJob;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::Path;

pub async fn run(app: &AppContext, request: BacktestRequest, output: Option<&Path>) -> Result<()> {
    let job = WalkForwardJob::from_request(&request, app.runtime())?;
    info!(
        "Walk-forward over {} windows from {} to {}, stitching {} at a time",
        job.windows.len(),
        request.start_date,
        request.end_date,
        job.window_length
    );

    let scheduler = app.scheduler();
    let id = scheduler.spawn(job);
    let mut updates = app.tasks().subscribe(&id)?;
    let pb = progress_bar(100)?;
    let mut cancel_requested = false;

    let record = loop {
        let record = updates.borrow_and_update().clone();
        pb.set_position(record.overall_progress.round() as u64);
        if record.status.is_terminal() {
            break record;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break updates.borrow().clone();
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                warn!("Interrupt received, cancelling task {}", id);
                app.tasks().cancel(&id)?;
                cancel_requested = true;
            }
        }
    };
    pb.finish_and_clear();
    app.tasks().remove(&id);

    for (window_id, outcome) in &record.results {
        if let Some(message) = outcome.failure() {
            warn!("Window {} failed: {}", window_id, message);
        }
    }
    if let Some(aggregated) = &record.aggregated_results {
        for result in aggregated {
            info!(
                "{} {}: {} slides ({} without trades), avg sharpe {}",
                result.symbol,
                result.strategy,
                result.segments,
                result.no_trade_segments,
                result
                    .avg_sharpe
                    .map(|value| format!("{:.3}", value))
                    .unwrap_or_else(|| "n/a".to_string())
            );
        }
    }

    write_json(&record, output)?;
    match record.status {
        TaskStatus::Done => Ok(()),
        status => Err(anyhow!(
            "Walk-forward task ended as {:?}: {}",
            status,
            record.error.as_deref().unwrap_or("no details")
        )),
    }
}
