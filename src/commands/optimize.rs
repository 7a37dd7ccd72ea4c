use crate::commands::{progress_bar, write_json};
use crate::context::AppContext;
use crate::optimizer::OptimizationRequest;
use crate::optimizer_status::OptimizerStatus;
use crate::param_utils::describe_params;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;

pub async fn run(app: &AppContext, request: OptimizationRequest, output: Option<&Path>) -> Result<()> {
    info!(
        "Optimizing {} strateg{} with {} trials each ({:?} search)",
        request.search_spaces.len(),
        if request.search_spaces.len() == 1 { "y" } else { "ies" },
        request.trials,
        request.algorithm
    );

    let status = OptimizerStatus::new();
    let driver = app.optimizer(status.clone());
    let pb = progress_bar((request.search_spaces.len() * request.trials) as u64)?;
    let mut ticker = tokio::time::interval(app.runtime().poll_interval);

    let optimization = driver.optimize(&request);
    tokio::pin!(optimization);
    let results = loop {
        tokio::select! {
            results = &mut optimization => break results?,
            _ = ticker.tick() => {
                let completed: usize = status
                    .snapshot()
                    .values()
                    .map(|progress| progress.completed_trials)
                    .sum();
                pb.set_position(completed as u64);
            }
        }
    };
    pb.finish_and_clear();

    for result in &results {
        match (&result.best_score, &result.best_params) {
            (Some(score), Some(params)) => info!(
                "{}: best score {:.4} with {}",
                result.strategy,
                score,
                describe_params(params)
            ),
            _ => warn!("{}: every trial failed", result.strategy),
        }
    }

    write_json(&results, output)
}
