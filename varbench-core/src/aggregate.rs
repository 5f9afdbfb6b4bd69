//! Aggregation: rebuilding an `Experiment` from a flat trial result list.
//!
//! The fold is order-independent: shuffling the input list changes nothing
//! but the first-seen ordering of the output buckets. Means are computed
//! only over the results present at aggregation time; there is no streaming
//! update.

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::evaluator::EvaluatorSet;
use crate::types::{CombinationMetrics, Experiment, GroupedResult, TrialResult};

fn mean(values: &[f64]) -> f64 {
    // Mean over an empty list is 0 by convention.
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Buckets results by key, preserving first-seen key order.
fn bucket_by<F>(results: Vec<TrialResult>, key_fn: F) -> Vec<(String, Vec<TrialResult>)>
where
    F: Fn(&TrialResult) -> String,
{
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<TrialResult>> = HashMap::new();
    for result in results {
        let key = key_fn(&result);
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(result);
    }
    order
        .into_iter()
        .map(|key| {
            let bucket = buckets.remove(&key).unwrap_or_default();
            (key, bucket)
        })
        .collect()
}

fn combination_metrics(combo_key: String, results: Vec<TrialResult>) -> CombinationMetrics {
    let mut metric_values: HashMap<String, Vec<f64>> = HashMap::new();
    for result in &results {
        for output in &result.evaluator_outputs {
            if let Some(value) = output.numeric_result() {
                metric_values.entry(output.metric_key()).or_default().push(value);
            }
        }
    }
    let aggregated_metrics = metric_values
        .into_iter()
        .map(|(key, values)| (key, mean(&values)))
        .collect();
    let average_token_usage = mean(
        &results
            .iter()
            .map(|r| r.token_usage as f64)
            .collect::<Vec<_>>(),
    );
    let average_latency = mean(&results.iter().map(|r| r.latency_ms).collect::<Vec<_>>());
    CombinationMetrics {
        combo_key,
        results,
        aggregated_metrics,
        average_token_usage,
        average_latency,
    }
}

/// Rebuilds an `Experiment` from a flat list of trial results.
///
/// Groups by input identity (optionally running comparison evaluators over
/// each group), then by combination identity, then optionally runs global
/// evaluators over the assembled experiment.
#[instrument(skip_all, fields(results_count = results.len()))]
pub async fn generate_experiment(
    results: Vec<TrialResult>,
    evaluators: &EvaluatorSet,
    evaluate_group: bool,
    evaluate_global: bool,
) -> Experiment {
    let mut grouped_results = Vec::new();
    for (group_key, mut group) in bucket_by(results, |r| r.input.group_key()) {
        if evaluate_group {
            evaluators.evaluate_group(&mut group).await;
        }
        grouped_results.push(GroupedResult {
            group_key,
            results: group,
            group_evaluator_outputs: Vec::new(),
        });
    }

    let flat: Vec<TrialResult> = grouped_results
        .iter()
        .flat_map(|g| g.results.iter().cloned())
        .collect();
    let combination_metrics: Vec<CombinationMetrics> = bucket_by(flat, |r| r.combination.key())
        .into_iter()
        .map(|(combo_key, bucket)| combination_metrics(combo_key, bucket))
        .collect();

    debug!(
        groups = grouped_results.len(),
        combinations = combination_metrics.len(),
        "aggregation pass complete"
    );

    let mut experiment = Experiment {
        grouped_results,
        combination_metrics,
        selection_output: None,
    };
    if evaluate_global {
        let mut experiments = [experiment];
        evaluators.evaluate_global(&mut experiments).await;
        let [rebuilt] = experiments;
        experiment = rebuilt;
    }
    experiment
}
