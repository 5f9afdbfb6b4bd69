//! The experiment result data model.
//!
//! `TrialResult` records are produced by the executor, scored by evaluators,
//! and folded into `GroupedResult` / `CombinationMetrics` buckets by the
//! aggregator. The `Experiment` aggregate root is always rebuilt whole from a
//! flat result list, never updated incrementally.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::json::canonical_string;
use crate::variation::Combination;

/// One row of the dataset. Immutable once read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: String,
    /// Named arguments for the user function.
    pub content: Map<String, Value>,
    pub expected_result: Option<Value>,
}

impl InputRecord {
    pub fn new(id: impl Into<String>, content: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            content,
            expected_result: None,
        }
    }

    pub fn with_expected(mut self, expected: Value) -> Self {
        self.expected_result = Some(expected);
        self
    }

    /// Identity key used for grouping: the whole record, canonically
    /// serialized.
    pub fn group_key(&self) -> String {
        let value = serde_json::json!({
            "id": self.id,
            "content": Value::Object(self.content.clone()),
            "expected_result": self.expected_result,
        });
        canonical_string(&value)
    }
}

/// Raw output of the user function for one trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialOutput {
    pub text: Option<String>,
}

impl TrialOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// Declares how multiple outputs with the same metric key are folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    Mean,
}

/// A single score emitted by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorOutput {
    pub name: String,
    pub display_name: Option<String>,
    /// A number or a label.
    pub result: Value,
    pub aggregation_method: AggregationMethod,
}

impl EvaluatorOutput {
    pub fn new(name: impl Into<String>, result: Value) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            result,
            aggregation_method: AggregationMethod::Mean,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Metric key under which this output aggregates: the evaluator name,
    /// qualified by the display name when one is present.
    pub fn metric_key(&self) -> String {
        match &self.display_name {
            Some(display_name) => format!("{}: {}", self.name, display_name),
            None => self.name.clone(),
        }
    }

    /// Numeric view of the result; booleans count as 1.0 / 0.0, labels as
    /// `None`.
    pub fn numeric_result(&self) -> Option<f64> {
        match &self.result {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// One execution of the user function under one combination against one
/// input. Immutable after the evaluation phase completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub input: InputRecord,
    pub combination: Combination,
    pub raw_output: TrialOutput,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: f64,
    pub token_usage: u64,
    pub evaluator_outputs: Vec<EvaluatorOutput>,
}

/// All trial results sharing one input identity, plus group-level evaluator
/// outputs. Recomputed whenever the result set changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedResult {
    pub group_key: String,
    pub results: Vec<TrialResult>,
    pub group_evaluator_outputs: Vec<EvaluatorOutput>,
}

/// All trial results sharing one combination identity, plus derived metrics.
/// Always rebuilt fresh from the full result list for the combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinationMetrics {
    pub combo_key: String,
    pub results: Vec<TrialResult>,
    /// Mean of each evaluator's numeric outputs, keyed by metric key.
    pub aggregated_metrics: HashMap<String, f64>,
    pub average_token_usage: f64,
    pub average_latency: f64,
}

/// Result of best-combination selection: the winner's combo key and a
/// per-criterion signed, weighted contribution diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionOutput {
    pub best_combination: String,
    pub contribution: HashMap<String, f64>,
}

impl SelectionOutput {
    /// Scalar score of the winner: sum of the per-criterion contributions.
    pub fn total_score(&self) -> f64 {
        self.contribution.values().sum()
    }
}

/// The aggregate root for one aggregation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub grouped_results: Vec<GroupedResult>,
    pub combination_metrics: Vec<CombinationMetrics>,
    pub selection_output: Option<SelectionOutput>,
}

impl Experiment {
    /// Flat view of every trial result in the experiment, in combination
    /// bucket order.
    pub fn all_results(&self) -> impl Iterator<Item = &TrialResult> {
        self.combination_metrics
            .iter()
            .flat_map(|metrics| metrics.results.iter())
    }
}

/// Output of an enhancer run: the union of all iterations' results,
/// aggregated, plus the combo key the search started from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancerOutput {
    pub grouped_results: Vec<GroupedResult>,
    pub combination_metrics: Vec<CombinationMetrics>,
    pub original_best_combo_key: String,
    pub selection_output: Option<SelectionOutput>,
}
