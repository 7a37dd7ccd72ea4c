use crate::config::RuntimeSettings;
use crate::error::{EngineError, EngineResult};
use crate::history_check::{plan_training_range, CrossValidationSettings};
use crate::models::TaskStatus;
use crate::optimizer_status::OptimizerStatus;
use crate::param_utils::{
    add_single_parameter_neighbor_variations, describe_params, variation_key, ParameterValues,
    SearchSpace,
};
use crate::request::BacktestRequest;
use crate::scheduler::{WalkForwardJob, WindowScheduler};
use crate::scoring::{composite_score, MetricRanges, ScoringWeights};
use futures::future::join_all;
use futures::FutureExt;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::time::Instant;

pub const DEFAULT_SEED: u64 = 42;

fn default_trials() -> usize {
    20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchAlgorithm {
    #[default]
    Random,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    /// Symbols, settings and fixed strategy parameters shared by every trial.
    pub backtest: BacktestRequest,
    /// Search space per strategy name; each strategy is studied independently.
    pub search_spaces: BTreeMap<String, SearchSpace>,
    #[serde(default = "default_trials")]
    pub trials: usize,
    #[serde(default)]
    pub algorithm: SearchAlgorithm,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub metric_ranges: MetricRanges,
    /// When set, trials run on the history before `backtest.startDate`.
    #[serde(default)]
    pub cross_validation: Option<CrossValidationSettings>,
}

impl OptimizationRequest {
    pub fn validate(&self) -> EngineResult<()> {
        self.backtest.validate()?;
        if self.trials == 0 {
            return Err(EngineError::invalid("trials must be at least 1"));
        }
        if self.search_spaces.is_empty() {
            return Err(EngineError::invalid("searchSpaces must not be empty"));
        }
        for (strategy, space) in &self.search_spaces {
            if !self.backtest.symbols.iter().any(|item| &item.strategy == strategy) {
                return Err(EngineError::invalid(format!(
                    "search space given for {} but no symbol uses it",
                    strategy
                )));
            }
            space.validate()?;
        }
        if let Some(cv) = &self.cross_validation {
            cv.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub number: usize,
    pub params: ParameterValues,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOptimizationResult {
    pub strategy: String,
    pub best_score: Option<f64>,
    pub best_params: Option<ParameterValues>,
    pub best_basic_params: ParameterValues,
    pub best_advanced_params: ParameterValues,
    pub trials: Vec<Trial>,
}

/// Black-box search strategy: proposes parameter vectors and learns from their scores.
pub trait Optimizer: Send {
    fn suggest(&mut self, space: &SearchSpace, history: &[Trial]) -> ParameterValues;
    fn report(&mut self, params: &ParameterValues, score: f64);
}

/// Independent uniform samples over the searched parameters.
pub struct RandomSearch {
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Optimizer for RandomSearch {
    fn suggest(&mut self, space: &SearchSpace, _history: &[Trial]) -> ParameterValues {
        space.sample(&mut self.rng)
    }

    fn report(&mut self, _params: &ParameterValues, _score: f64) {}
}

/// Hill climbing: after a random start, try single-parameter steps around the
/// best vector seen so far; restart randomly once a best has no untried neighbours.
pub struct LocalSearch {
    rng: StdRng,
    step_multipliers: Vec<f64>,
    best: Option<(ParameterValues, f64)>,
    pending: VecDeque<ParameterValues>,
    seen: HashSet<String>,
    expanded: HashSet<String>,
}

impl LocalSearch {
    pub fn new(seed: u64, step_multipliers: Vec<f64>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            step_multipliers,
            best: None,
            pending: VecDeque::new(),
            seen: HashSet::new(),
            expanded: HashSet::new(),
        }
    }
}

impl Optimizer for LocalSearch {
    fn suggest(&mut self, space: &SearchSpace, _history: &[Trial]) -> ParameterValues {
        loop {
            if let Some(params) = self.pending.pop_front() {
                return params;
            }
            if let Some((best, _)) = &self.best {
                if self.expanded.insert(variation_key(best)) {
                    let mut neighbours = Vec::new();
                    add_single_parameter_neighbor_variations(
                        space,
                        &self.step_multipliers,
                        best,
                        &mut self.seen,
                        &mut neighbours,
                    );
                    self.pending.extend(neighbours);
                    continue;
                }
            }
            let params = space.sample(&mut self.rng);
            self.seen.insert(variation_key(&params));
            return params;
        }
    }

    fn report(&mut self, params: &ParameterValues, score: f64) {
        let improved = score.is_finite()
            && self
                .best
                .as_ref()
                .map_or(true, |(_, best_score)| score > *best_score);
        if improved {
            self.best = Some((params.clone(), score));
            self.pending.clear();
        }
    }
}

/// Runs one study per strategy, scoring every trial with the full
/// walk-forward pipeline.
pub struct OptimizationDriver {
    scheduler: WindowScheduler,
    runtime: RuntimeSettings,
    status: OptimizerStatus,
}

impl OptimizationDriver {
    pub fn new(scheduler: WindowScheduler, runtime: RuntimeSettings, status: OptimizerStatus) -> Self {
        Self {
            scheduler,
            runtime,
            status,
        }
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub async fn optimize(
        &self,
        request: &OptimizationRequest,
    ) -> EngineResult<Vec<StrategyOptimizationResult>> {
        request.validate()?;
        let base = self.training_request(request).await?;
        let seed = request.seed.unwrap_or(DEFAULT_SEED);

        for strategy in request.search_spaces.keys() {
            self.status.register(strategy, request.trials);
        }

        let studies = request.search_spaces.iter().map(|(strategy, space)| {
            let strategy_request = base.only_strategy(strategy);
            let mut optimizer: Box<dyn Optimizer> = match request.algorithm {
                SearchAlgorithm::Random => Box::new(RandomSearch::new(seed)),
                SearchAlgorithm::Local => Box::new(LocalSearch::new(
                    seed,
                    self.runtime.local_search_step_multipliers.clone(),
                )),
            };
            async move {
                self.run_study(
                    strategy,
                    space,
                    &strategy_request,
                    optimizer.as_mut(),
                    request.trials,
                    &request.scoring,
                    &request.metric_ranges,
                )
                .await
            }
        });

        Ok(join_all(studies).await)
    }

    /// The request trials are scored on: the history before the backtest when
    /// cross-validation is configured, otherwise the request itself.
    async fn training_request(&self, request: &OptimizationRequest) -> EngineResult<BacktestRequest> {
        let Some(cv) = &request.cross_validation else {
            return Ok(request.backtest.clone());
        };

        let symbols = request.backtest.symbol_universe();
        let provider = self.scheduler.provider();
        let lookup = symbols.clone();
        let first_dates = tokio::task::spawn_blocking(move || provider.first_dates(&lookup))
            .await
            .map_err(|err| EngineError::Provider(err.to_string()))?
            .map_err(|err| EngineError::Provider(format!("{:#}", err)))?;

        let plan = plan_training_range(&symbols, &first_dates, request.backtest.start_date, cv)?;
        info!(
            "Training on {} to {} ({} folds of {} years)",
            plan.start, plan.end, plan.folds, cv.fold_years
        );

        let mut training = request.backtest.clone();
        training.start_date = plan.start;
        training.end_date = plan.end;
        training.window_years = Some(cv.fold_years);
        // One fold per window: a slide can never span more windows than there are folds.
        let stitch = request
            .backtest
            .window_length
            .unwrap_or(self.runtime.stitch_length);
        training.window_length = Some(stitch.clamp(1, plan.folds as usize));
        Ok(training)
    }

    /// Run `trials` sequential trials for one strategy. Every trial is guarded:
    /// errors and panics score `f64::NEG_INFINITY` and the study goes on.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_study(
        &self,
        strategy: &str,
        space: &SearchSpace,
        request: &BacktestRequest,
        optimizer: &mut dyn Optimizer,
        trials: usize,
        weights: &ScoringWeights,
        ranges: &MetricRanges,
    ) -> StrategyOptimizationResult {
        self.status.set_status(strategy, TaskStatus::Running);
        info!("Optimizing {} over {} trials", strategy, trials);

        let fixed = space.fixed_values();
        let mut history: Vec<Trial> = Vec::with_capacity(trials);
        let mut best: Option<(usize, f64)> = None;

        for number in 0..trials {
            let suggested = optimizer.suggest(space, &history);
            let mut params = fixed.clone();
            params.extend(suggested.clone());

            let started = Instant::now();
            let outcome = AssertUnwindSafe(self.score_trial(number, strategy, request, &params, weights, ranges))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(EngineError::OptimizationTrial {
                        trial: number,
                        message: "scoring panicked".to_string(),
                    })
                });

            let (score, error) = match outcome {
                Ok(score) if score.is_finite() => (score, None),
                Ok(score) => (
                    f64::NEG_INFINITY,
                    Some(format!("non-finite score {}", score)),
                ),
                Err(err) => (f64::NEG_INFINITY, Some(err.to_string())),
            };

            if let Some(message) = &error {
                warn!(
                    "{} trial {} failed after {:.1}s: {} [{}]",
                    strategy,
                    number,
                    started.elapsed().as_secs_f64(),
                    message,
                    describe_params(&params)
                );
            } else {
                info!(
                    "{} trial {} scored {:.4} in {:.1}s [{}]",
                    strategy,
                    number,
                    score,
                    started.elapsed().as_secs_f64(),
                    describe_params(&params)
                );
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    if let Some((_, previous)) = best {
                        info!("New best for {}: {:.4} (previous: {:.4})", strategy, score, previous);
                    }
                    best = Some((number, score));
                }
            }

            optimizer.report(&suggested, score);
            self.status
                .record_trial(strategy, score, &params, error.is_some());
            history.push(Trial {
                number,
                params,
                score,
                error,
            });
        }

        self.status.set_status(strategy, TaskStatus::Done);

        let best_params = best.map(|(number, _)| history[number].params.clone());
        let (best_basic_params, best_advanced_params) = best_params
            .as_ref()
            .map(|params| space.split_by_category(params))
            .unwrap_or_default();
        match best {
            Some((_, score)) => info!("{} optimization finished. Best score: {:.4}", strategy, score),
            None => warn!("{} optimization finished without a successful trial", strategy),
        }

        StrategyOptimizationResult {
            strategy: strategy.to_string(),
            best_score: best.map(|(_, score)| score),
            best_params,
            best_basic_params,
            best_advanced_params,
            trials: history,
        }
    }

    async fn score_trial(
        &self,
        number: usize,
        strategy: &str,
        request: &BacktestRequest,
        params: &ParameterValues,
        weights: &ScoringWeights,
        ranges: &MetricRanges,
    ) -> EngineResult<f64> {
        let trial_request = request.with_strategy_params(strategy, params);
        let job = WalkForwardJob::from_request(&trial_request, &self.runtime)?;
        let record = self.scheduler.run_to_completion(job).await?;
        if record.status != TaskStatus::Done {
            return Err(EngineError::OptimizationTrial {
                trial: number,
                message: record
                    .error
                    .unwrap_or_else(|| format!("walk-forward ended as {:?}", record.status)),
            });
        }
        let aggregated = record.aggregated_results.unwrap_or_default();
        Ok(composite_score(&aggregated, weights, ranges))
    }
}
