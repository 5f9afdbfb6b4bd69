//! Trial execution: one user-function call per (input, combination) pair.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Error;
use crate::state::VariationState;
use crate::types::{InputRecord, TrialOutput, TrialResult};
use crate::usage::TokenMeter;
use crate::variation::Combination;

/// The user-supplied function under test. May be network-bound. It reads its
/// active treatment through `VariationState::next_variation` and reports
/// token usage into the meter; retry policy, if any, lives inside the
/// implementation.
#[async_trait]
pub trait TrialFunction: Send + Sync {
    async fn call(
        &self,
        input: &InputRecord,
        state: &VariationState,
        meter: &TokenMeter,
    ) -> Result<TrialOutput, Error>;
}

/// Executes the user function once per (input, combination) pair, capturing
/// wall-clock latency and token usage. Performs no retries and no
/// evaluation; results come back with empty evaluator outputs.
#[derive(Clone)]
pub struct TrialExecutor {
    function: Arc<dyn TrialFunction>,
}

impl TrialExecutor {
    pub fn new(function: Arc<dyn TrialFunction>) -> Self {
        Self { function }
    }

    /// Runs a single trial. Each trial operates on its own clone of the
    /// variation state, pinned to `combination`, so concurrent trials never
    /// share mutable state.
    pub async fn run_trial(
        &self,
        input: &InputRecord,
        combination: &Combination,
        state: &VariationState,
        meter: &TokenMeter,
    ) -> Result<TrialResult, Error> {
        let mut pinned = state.clone();
        pinned.select_combination(combination)?;
        pinned.set_active(true);

        let tokens_before = meter.total();
        let started = Instant::now();
        let raw_output = self
            .function
            .call(input, &pinned, meter)
            .await
            .map_err(|e| Error::Trial {
                input_id: input.id.clone(),
                message: e.to_string(),
            })?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let token_usage = meter.total().saturating_sub(tokens_before);

        debug!(
            input_id = %input.id,
            combo_key = %combination.key(),
            latency_ms,
            token_usage,
            "trial completed"
        );

        Ok(TrialResult {
            input: input.clone(),
            combination: combination.clone(),
            raw_output,
            latency_ms,
            token_usage,
            evaluator_outputs: Vec::new(),
        })
    }

    /// Runs every combination for one input sequentially, collecting the
    /// successes. A failed pair is logged and omitted; it never aborts the
    /// remaining pairs.
    pub async fn run_single_input(
        &self,
        input: &InputRecord,
        combinations: &[Combination],
        state: &VariationState,
    ) -> Vec<TrialResult> {
        let meter = TokenMeter::new();
        let mut results = Vec::with_capacity(combinations.len());
        for combination in combinations {
            match self.run_trial(input, combination, state, &meter).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(input_id = %input.id, "dropping failed trial: {e}");
                }
            }
        }
        results
    }
}
