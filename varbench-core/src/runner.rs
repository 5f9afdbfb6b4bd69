//! The full experiment pass: fan out trials, score, aggregate, select.
//!
//! This is also the re-entry point the enhancer loops call once per
//! iteration after swapping in new candidate variations.

use std::sync::Arc;

use indicatif::ProgressBar;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::aggregate::generate_experiment;
use crate::config::RunnerSettings;
use crate::error::Error;
use crate::evaluator::EvaluatorSet;
use crate::executor::{TrialExecutor, TrialFunction};
use crate::rate_limiter::RateLimiter;
use crate::selection::SelectionStrategy;
use crate::state::VariationState;
use crate::types::{Experiment, InputRecord, TrialResult};
use crate::variation::VariationGroup;

pub struct ExperimentRunner {
    executor: TrialExecutor,
    evaluators: EvaluatorSet,
    limiter: Arc<RateLimiter>,
    strategy: Option<Arc<dyn SelectionStrategy>>,
    data: Vec<InputRecord>,
    state: VariationState,
    settings: RunnerSettings,
    run_id: Uuid,
}

impl ExperimentRunner {
    pub fn new(
        function: Arc<dyn TrialFunction>,
        evaluators: EvaluatorSet,
        data: Vec<InputRecord>,
        settings: RunnerSettings,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.max_rate));
        Self {
            executor: TrialExecutor::new(function),
            evaluators,
            limiter,
            strategy: None,
            data,
            state: VariationState::new(),
            settings,
            run_id: Uuid::now_v7(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn data(&self) -> &[InputRecord] {
        &self.data
    }

    /// Replaces the dataset, as the enhancer loops do when re-running the
    /// held-out inputs collected from a previous experiment.
    pub fn set_data(&mut self, data: Vec<InputRecord>) {
        self.data = data;
    }

    /// Replaces the active variation groups. Not safe to call while a pass
    /// is running; set, then run.
    pub fn set_groups(&mut self, groups: Vec<VariationGroup>) {
        self.state.set_groups(groups);
        self.state.set_active(true);
    }

    pub fn state(&self) -> &VariationState {
        &self.state
    }

    pub fn evaluators(&self) -> &EvaluatorSet {
        &self.evaluators
    }

    /// Applies the configured selection strategy, if any, to an already
    /// aggregated experiment. Selection failure is logged, never fatal.
    pub fn apply_selection(&self, experiment: &mut Experiment) {
        if let Some(strategy) = &self.strategy {
            match strategy.select(experiment) {
                Ok(output) => experiment.selection_output = Some(output),
                Err(e) => warn!("selection skipped: {e}"),
            }
        }
    }

    /// Runs one full pass: every (input × combination-set) pair through the
    /// executor concurrently, individual scoring per result, then a fresh
    /// aggregation and optionally selection.
    ///
    /// A failed or panicked task degrades the result set but never aborts
    /// the pass. Selection failure (for example, every trial failed) is
    /// logged and leaves `selection_output` unset.
    #[instrument(skip_all, fields(run_id = %self.run_id, inputs = self.data.len()))]
    pub async fn run(&self, enable_selector: bool) -> Result<Experiment, Error> {
        let combinations = Arc::new(self.state.enumerate_combinations());
        info!(
            combinations = combinations.len(),
            concurrency = self.settings.concurrency,
            "starting experiment pass"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let progress = self
            .settings
            .progress
            .then(|| ProgressBar::new(self.data.len() as u64));

        let mut join_set: JoinSet<Vec<TrialResult>> = JoinSet::new();
        for input in self.data.iter().cloned() {
            let executor = self.executor.clone();
            let evaluators = self.evaluators.clone();
            let limiter = Arc::clone(&self.limiter);
            let semaphore = Arc::clone(&semaphore);
            let combinations = Arc::clone(&combinations);
            let state = self.state.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Vec::new(),
                };
                limiter.acquire().await;
                let mut results = executor
                    .run_single_input(&input, &combinations, &state)
                    .await;
                for result in &mut results {
                    result.evaluator_outputs = evaluators.evaluate_individual(result).await;
                }
                results
            });
        }

        let mut all_results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(results) => all_results.extend(results),
                Err(e) => warn!("trial task panicked, dropping its results: {e}"),
            }
            if let Some(progress) = &progress {
                progress.inc(1);
            }
        }
        if let Some(progress) = progress {
            progress.finish_with_message("Done");
        }

        let mut experiment =
            generate_experiment(all_results, &self.evaluators, true, true).await;

        if enable_selector {
            self.apply_selection(&mut experiment);
        }

        info!(
            groups = experiment.grouped_results.len(),
            combinations = experiment.combination_metrics.len(),
            "experiment pass complete"
        );
        Ok(experiment)
    }
}
