//! Evaluator traits, registry, and dispatch.
//!
//! Scoring capabilities are registered under string names and resolved once
//! at configuration-load time; referencing an unknown name is a fatal config
//! error raised before any trial executes. At run time a failing scorer is
//! logged and skipped, never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;
use crate::types::{EvaluatorOutput, Experiment, TrialResult};

/// Scores a single trial result.
#[async_trait]
pub trait IndividualEvaluator: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means the evaluator ran but has nothing to report (for
    /// example, no reference output is present).
    async fn evaluate(&self, result: &TrialResult) -> Result<Option<EvaluatorOutput>, Error>;
}

/// Scores a group of results sharing one input, appending verdicts to each
/// member's evaluator outputs in place.
#[async_trait]
pub trait ComparisonEvaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate_group(&self, results: &mut [TrialResult]) -> Result<(), Error>;
}

/// Scores that need the entire result corpus, run once per aggregation pass
/// after individual and group scoring.
#[async_trait]
pub trait GlobalEvaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate_global(&self, experiments: &mut [Experiment]) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorType {
    Individual,
    Comparison,
    Global,
}

/// A named reference to a registered evaluator, as it appears in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorRef {
    pub name: String,
    pub evaluator_type: EvaluatorType,
}

/// Registry mapping evaluator names to capability implementations.
#[derive(Default)]
pub struct EvaluatorRegistry {
    individual: HashMap<String, Arc<dyn IndividualEvaluator>>,
    comparison: HashMap<String, Arc<dyn ComparisonEvaluator>>,
    global: HashMap<String, Arc<dyn GlobalEvaluator>>,
}

impl EvaluatorRegistry {
    /// A registry preloaded with the built-in evaluators.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register_individual(Arc::new(ExpectedMatchEvaluator));
        registry
    }

    pub fn register_individual(&mut self, evaluator: Arc<dyn IndividualEvaluator>) {
        self.individual
            .insert(evaluator.name().to_string(), evaluator);
    }

    pub fn register_comparison(&mut self, evaluator: Arc<dyn ComparisonEvaluator>) {
        self.comparison
            .insert(evaluator.name().to_string(), evaluator);
    }

    pub fn register_global(&mut self, evaluator: Arc<dyn GlobalEvaluator>) {
        self.global.insert(evaluator.name().to_string(), evaluator);
    }

    /// Resolves config references into a bound evaluator set, failing fast on
    /// unknown names.
    pub fn resolve(&self, refs: &[EvaluatorRef]) -> Result<EvaluatorSet, Error> {
        let mut set = EvaluatorSet::default();
        for reference in refs {
            match reference.evaluator_type {
                EvaluatorType::Individual => {
                    let evaluator = self.individual.get(&reference.name).ok_or_else(|| {
                        Error::config(format!("unknown individual evaluator `{}`", reference.name))
                    })?;
                    set.individual.push(Arc::clone(evaluator));
                }
                EvaluatorType::Comparison => {
                    let evaluator = self.comparison.get(&reference.name).ok_or_else(|| {
                        Error::config(format!("unknown comparison evaluator `{}`", reference.name))
                    })?;
                    set.comparison.push(Arc::clone(evaluator));
                }
                EvaluatorType::Global => {
                    let evaluator = self.global.get(&reference.name).ok_or_else(|| {
                        Error::config(format!("unknown global evaluator `{}`", reference.name))
                    })?;
                    set.global.push(Arc::clone(evaluator));
                }
            }
        }
        Ok(set)
    }
}

/// The evaluators bound to one experiment run.
#[derive(Default, Clone)]
pub struct EvaluatorSet {
    individual: Vec<Arc<dyn IndividualEvaluator>>,
    comparison: Vec<Arc<dyn ComparisonEvaluator>>,
    global: Vec<Arc<dyn GlobalEvaluator>>,
}

impl std::fmt::Debug for EvaluatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluatorSet")
            .field("individual", &self.individual.len())
            .field("comparison", &self.comparison.len())
            .field("global", &self.global.len())
            .finish()
    }
}

impl EvaluatorSet {
    pub fn is_empty(&self) -> bool {
        self.individual.is_empty() && self.comparison.is_empty() && self.global.is_empty()
    }

    /// Runs every individual scorer against one result concurrently,
    /// collecting all non-null outputs. A scorer failing is logged and does
    /// not block the others.
    pub async fn evaluate_individual(&self, result: &TrialResult) -> Vec<EvaluatorOutput> {
        let mut futures = FuturesUnordered::new();
        for evaluator in &self.individual {
            let evaluator = Arc::clone(evaluator);
            futures.push(async move {
                let name = evaluator.name().to_string();
                (name, evaluator.evaluate(result).await)
            });
        }
        let mut outputs = Vec::new();
        while let Some((name, outcome)) = futures.next().await {
            match outcome {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => debug!(evaluator = %name, "evaluator produced no output"),
                Err(e) => warn!(evaluator = %name, "individual evaluator failed: {e}"),
            }
        }
        outputs
    }

    /// Runs every comparison scorer across a full input group, mutating each
    /// member's evaluator outputs in place.
    pub async fn evaluate_group(&self, results: &mut [TrialResult]) {
        for evaluator in &self.comparison {
            if let Err(e) = evaluator.evaluate_group(results).await {
                warn!(evaluator = %evaluator.name(), "comparison evaluator failed: {e}");
            }
        }
    }

    /// Runs every global scorer over the whole corpus.
    pub async fn evaluate_global(&self, experiments: &mut [Experiment]) {
        for evaluator in &self.global {
            if let Err(e) = evaluator.evaluate_global(experiments).await {
                warn!(evaluator = %evaluator.name(), "global evaluator failed: {e}");
            }
        }
    }
}

/// Built-in individual evaluator: string equality of the trial's text output
/// against the input's expected result. Emits a boolean, which aggregates to
/// an accuracy mean.
pub struct ExpectedMatchEvaluator;

pub const EXPECTED_MATCH_EVALUATOR: &str = "expected_match";

#[async_trait]
impl IndividualEvaluator for ExpectedMatchEvaluator {
    fn name(&self) -> &str {
        EXPECTED_MATCH_EVALUATOR
    }

    async fn evaluate(&self, result: &TrialResult) -> Result<Option<EvaluatorOutput>, Error> {
        let Some(expected) = &result.input.expected_result else {
            return Ok(None);
        };
        let Some(actual) = &result.raw_output.text else {
            return Ok(None);
        };
        let expected_text = match expected {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let matches = expected_text.trim() == actual.trim();
        Ok(Some(EvaluatorOutput::new(
            EXPECTED_MATCH_EVALUATOR,
            Value::Bool(matches),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputRecord, TrialOutput};
    use crate::variation::Combination;
    use serde_json::{json, Map};

    fn result_with(expected: Option<Value>, text: Option<&str>) -> TrialResult {
        let mut input = InputRecord::new("1", Map::new());
        input.expected_result = expected;
        TrialResult {
            input,
            combination: Combination::new(Map::new()),
            raw_output: TrialOutput {
                text: text.map(str::to_string),
            },
            latency_ms: 1.0,
            token_usage: 0,
            evaluator_outputs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_expected_match_scores_equality() {
        let evaluator = ExpectedMatchEvaluator;
        let hit = evaluator
            .evaluate(&result_with(Some(json!("yes")), Some(" yes ")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.result, json!(true));
        let miss = evaluator
            .evaluate(&result_with(Some(json!("yes")), Some("no")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(miss.result, json!(false));
        assert!(evaluator
            .evaluate(&result_with(None, Some("anything")))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_resolve_fails_fast_on_unknown_name() {
        let registry = EvaluatorRegistry::new();
        let err = registry
            .resolve(&[EvaluatorRef {
                name: "does_not_exist".to_string(),
                evaluator_type: EvaluatorType::Individual,
            }])
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    struct FailingEvaluator;

    #[async_trait]
    impl IndividualEvaluator for FailingEvaluator {
        fn name(&self) -> &str {
            "failing"
        }

        async fn evaluate(&self, _: &TrialResult) -> Result<Option<EvaluatorOutput>, Error> {
            Err(Error::Evaluator {
                name: "failing".to_string(),
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_scorer_does_not_block_others() {
        let mut registry = EvaluatorRegistry::new();
        registry.register_individual(Arc::new(FailingEvaluator));
        let set = registry
            .resolve(&[
                EvaluatorRef {
                    name: "failing".to_string(),
                    evaluator_type: EvaluatorType::Individual,
                },
                EvaluatorRef {
                    name: EXPECTED_MATCH_EVALUATOR.to_string(),
                    evaluator_type: EvaluatorType::Individual,
                },
            ])
            .unwrap();
        let result = result_with(Some(json!("x")), Some("x"));
        let outputs = set.evaluate_individual(&result).await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, EXPECTED_MATCH_EVALUATOR);
    }
}
