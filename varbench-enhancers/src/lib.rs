//! Iterative LLM-guided search over variation candidates.
//!
//! Both strategies share a loop shape: run a full experiment pass over the
//! live candidates, score them through selection, ask the completion service
//! for better candidates, and repeat for a bounded number of iterations. The
//! union of every iteration's trial results is aggregated into the final
//! output so earlier iterations remain inspectable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use varbench_core::{
    CompletionClient, CompletionRequest, Error, Experiment, ExperimentRunner, InputRecord,
    VariationGroup,
};

pub mod evolution;
pub mod opro;
pub mod parse;
pub mod similarity;

pub use evolution::{EvolutionConfig, EvolutionaryEnhancer};
pub use opro::{OproConfig, OptimizeByPromptEnhancer};

/// How many times a propose step is retried when the response parses to
/// nothing before the iteration gives up on it.
pub(crate) const PROPOSE_RETRIES: usize = 3;

/// An iterative search strategy over variation candidates.
///
/// `runner` arrives configured with the evaluators, selection strategy, and
/// pacing of the original experiment; the enhancer re-points its dataset and
/// variation groups at each candidate it wants scored.
#[async_trait]
pub trait CombinationEnhancer: Send + Sync {
    fn name(&self) -> &str;

    async fn enhance(
        &self,
        experiment: &Experiment,
        runner: &mut ExperimentRunner,
        client: Arc<dyn CompletionClient>,
    ) -> Result<varbench_core::EnhancerOutput, Error>;
}

/// Declarative enhancer configuration, dispatched on `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum EnhancerConfig {
    OptimizeByPrompt(OproConfig),
    Evolutionary(EvolutionConfig),
}

pub fn build_enhancer(config: &EnhancerConfig) -> Arc<dyn CombinationEnhancer> {
    match config {
        EnhancerConfig::OptimizeByPrompt(config) => {
            Arc::new(OptimizeByPromptEnhancer::new(config.clone()))
        }
        EnhancerConfig::Evolutionary(config) => Arc::new(EvolutionaryEnhancer::new(config.clone())),
    }
}

/// Reads the best combination and its per-criterion score out of a scored
/// experiment.
pub(crate) fn find_combo_with_score(
    experiment: &Experiment,
) -> Result<(HashMap<String, String>, HashMap<String, f64>), Error> {
    let selection = experiment.selection_output.as_ref().ok_or_else(|| {
        Error::Selection {
            message: "experiment has no selection output".to_string(),
        }
    })?;
    let combination = varbench_core::Combination::from_key(&selection.best_combination)?;
    let combo = combination
        .iter()
        .map(|(name, value)| (name.clone(), value_to_string(value)))
        .collect();
    Ok((combo, selection.contribution.clone()))
}

pub(crate) fn find_origin_combo_key(experiment: &Experiment) -> Result<String, Error> {
    experiment
        .selection_output
        .as_ref()
        .map(|selection| selection.best_combination.clone())
        .ok_or_else(|| Error::Selection {
            message: "enhancer requires a selected best combination".to_string(),
        })
}

/// Re-collects the original inputs from a scored experiment, dropping any
/// `raw_output` a previous pass may have folded into the content.
pub(crate) fn collect_input_records(experiment: &Experiment) -> Vec<InputRecord> {
    let Some(first_combo) = experiment.combination_metrics.first() else {
        return Vec::new();
    };
    first_combo
        .results
        .iter()
        .map(|result| {
            let mut input = result.input.clone();
            input.content.remove("raw_output");
            input
        })
        .collect()
}

/// Builds one single-candidate group per variable, pinning the runner to
/// exactly one combination.
pub(crate) fn groups_from_candidate(
    candidate: &HashMap<String, String>,
    order: &[String],
) -> Result<Vec<VariationGroup>, Error> {
    order
        .iter()
        .filter_map(|name| candidate.get(name).map(|value| (name, value)))
        .map(|(name, value)| VariationGroup::single(name.clone(), Value::String(value.clone())))
        .collect()
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One completion call with the response unwrapped from stray quoting. The
/// parse-retry loop lives in the callers; this only propagates transport
/// failures.
pub(crate) async fn fetch_response(
    client: &Arc<dyn CompletionClient>,
    model: &str,
    prompt: String,
) -> Result<String, Error> {
    let request =
        CompletionRequest::new(model, prompt).with_param("temperature", serde_json::json!(1.0));
    let response = client.complete(request).await?;
    Ok(parse::strip_outer_quotes(&response.text).to_string())
}

/// Propose step shared by both strategies: call the completion service and
/// parse `variables` out of the response, retrying a bounded number of times
/// when the parse comes back empty.
pub(crate) async fn propose_variations(
    client: &Arc<dyn CompletionClient>,
    model: &str,
    prompt: &str,
    variables: &[String],
) -> Result<Option<HashMap<String, String>>, Error> {
    for attempt in 0..PROPOSE_RETRIES {
        let response = fetch_response(client, model, prompt.to_string()).await?;
        let parsed = parse::extract_variations(&response, variables);
        if !parsed.is_empty() {
            return Ok(Some(parsed));
        }
        warn!(attempt, "proposal response contained no parseable variables");
    }
    Ok(None)
}
