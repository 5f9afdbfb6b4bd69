//! Best-combination selection.
//!
//! The shipped strategy is an Analytic-Hierarchy-style weighted ranking over
//! per-combination metrics. Strategies are resolved by name at configuration
//! load; unknown names fail fast.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::Error;
use crate::types::{CombinationMetrics, Experiment, SelectionOutput};

/// Guards divide-by-zero on constant columns.
const EPSILON: f64 = 1e-10;

pub const AVERAGE_TOKEN_USAGE: &str = "average_token_usage";
pub const AVERAGE_LATENCY: &str = "average_latency";
pub const AHP_SELECTION: &str = "ahp_selection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizeMethod {
    MinMax,
    ZScore,
}

/// Declarative selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub criteria: Vec<String>,
    pub weights: HashMap<String, f64>,
    /// Criteria default to maximization when absent.
    #[serde(default)]
    pub maximize: HashMap<String, bool>,
    #[serde(default)]
    pub normalize: Option<NormalizeMethod>,
}

fn default_strategy() -> String {
    AHP_SELECTION.to_string()
}

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn select(&self, experiment: &Experiment) -> Result<SelectionOutput, Error>;
}

impl std::fmt::Debug for dyn SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SelectionStrategy").field(&self.name()).finish()
    }
}

/// Resolves the configured strategy, failing fast on misconfiguration.
pub fn build_selection_strategy(
    config: &SelectionConfig,
) -> Result<Arc<dyn SelectionStrategy>, Error> {
    if config.criteria.is_empty() {
        return Err(Error::config("selection criteria list is empty"));
    }
    for criterion in &config.criteria {
        if !config.weights.contains_key(criterion) {
            return Err(Error::config(format!(
                "criterion `{criterion}` has no configured weight"
            )));
        }
    }
    match config.strategy.as_str() {
        AHP_SELECTION => Ok(Arc::new(AhpSelection {
            config: config.clone(),
        })),
        other => Err(Error::config(format!(
            "unknown selection strategy `{other}`"
        ))),
    }
}

/// Weighted, normalized multi-criteria ranking.
pub struct AhpSelection {
    config: SelectionConfig,
}

impl AhpSelection {
    /// Reads one combination's raw value for each configured criterion.
    /// A criterion matching no data defaults to 0.
    fn extract_data(&self, metrics: &CombinationMetrics) -> HashMap<String, f64> {
        let mut data = HashMap::new();
        for criterion in &self.config.criteria {
            let value = match criterion.as_str() {
                AVERAGE_TOKEN_USAGE => metrics.average_token_usage,
                AVERAGE_LATENCY => metrics.average_latency,
                name => metrics.aggregated_metrics.get(name).copied().unwrap_or(0.0),
            };
            data.insert(criterion.clone(), value);
        }
        data
    }

    fn maximized(&self, criterion: &str) -> bool {
        *self.config.maximize.get(criterion).unwrap_or(&true)
    }
}

impl SelectionStrategy for AhpSelection {
    fn name(&self) -> &str {
        AHP_SELECTION
    }

    #[instrument(skip_all, fields(combinations = experiment.combination_metrics.len()))]
    fn select(&self, experiment: &Experiment) -> Result<SelectionOutput, Error> {
        if experiment.combination_metrics.is_empty() {
            return Err(Error::Selection {
                message: "no combination metrics to select from".to_string(),
            });
        }

        // Criterion matrix: rows are combinations, columns follow the
        // configured criteria order.
        let raw_data: Vec<HashMap<String, f64>> = experiment
            .combination_metrics
            .iter()
            .map(|metrics| self.extract_data(metrics))
            .collect();
        let mut matrix: Vec<Vec<f64>> = raw_data
            .iter()
            .map(|data| {
                self.config
                    .criteria
                    .iter()
                    .map(|criterion| data[criterion])
                    .collect()
            })
            .collect();

        if let Some(method) = self.config.normalize {
            normalize_columns(&mut matrix, method);
        }

        for (column, criterion) in self.config.criteria.iter().enumerate() {
            let weight = self.config.weights[criterion];
            // Minimized criteria are negated so that a higher weighted score
            // is always better.
            let sign = if self.maximized(criterion) { 1.0 } else { -1.0 };
            for row in &mut matrix {
                row[column] *= weight * sign;
            }
        }

        // First maximum encountered wins ties.
        let mut best_index = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (index, row) in matrix.iter().enumerate() {
            let score: f64 = row.iter().sum();
            if score > best_score {
                best_score = score;
                best_index = index;
            }
        }

        let best_combination = experiment.combination_metrics[best_index].combo_key.clone();

        // Diagnostic contribution from the raw (unnormalized) values. This is
        // a human-readable approximation, not the normalized contribution the
        // ranking was decided on.
        let contribution = self
            .config
            .criteria
            .iter()
            .map(|criterion| {
                let raw = raw_data[best_index][criterion];
                let signed = if self.maximized(criterion) { 1.0 } else { -1.0 };
                (
                    criterion.clone(),
                    self.config.weights[criterion] * raw * signed,
                )
            })
            .collect();

        debug!(best = %best_combination, score = best_score, "selection complete");
        Ok(SelectionOutput {
            best_combination,
            contribution,
        })
    }
}

fn normalize_columns(matrix: &mut [Vec<f64>], method: NormalizeMethod) {
    if matrix.is_empty() {
        return;
    }
    let columns = matrix[0].len();
    for column in 0..columns {
        let values: Vec<f64> = matrix.iter().map(|row| row[column]).collect();
        match method {
            NormalizeMethod::MinMax => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                for row in matrix.iter_mut() {
                    row[column] = (row[column] - min) / (max - min + EPSILON);
                }
            }
            NormalizeMethod::ZScore => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
                let std = variance.sqrt();
                for row in matrix.iter_mut() {
                    row[column] = (row[column] - mean) / (std + EPSILON);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CombinationMetrics;

    fn metrics(combo_key: &str, tokens: f64, latency: f64, extra: &[(&str, f64)]) -> CombinationMetrics {
        CombinationMetrics {
            combo_key: combo_key.to_string(),
            results: Vec::new(),
            aggregated_metrics: extra
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            average_token_usage: tokens,
            average_latency: latency,
        }
    }

    fn experiment(metrics: Vec<CombinationMetrics>) -> Experiment {
        Experiment {
            grouped_results: Vec::new(),
            combination_metrics: metrics,
            selection_output: None,
        }
    }

    fn config(
        criteria: &[&str],
        weights: &[(&str, f64)],
        maximize: &[(&str, bool)],
        normalize: Option<NormalizeMethod>,
    ) -> SelectionConfig {
        SelectionConfig {
            strategy: AHP_SELECTION.to_string(),
            criteria: criteria.iter().map(|c| c.to_string()).collect(),
            weights: weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            maximize: maximize.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            normalize,
        }
    }

    #[test]
    fn test_single_maximized_criterion_picks_larger_raw_value() {
        let strategy = build_selection_strategy(&config(
            &["quality"],
            &[("quality", 1.0)],
            &[("quality", true)],
            None,
        ))
        .unwrap();
        let output = strategy
            .select(&experiment(vec![
                metrics("A", 0.0, 0.0, &[("quality", 0.4)]),
                metrics("B", 0.0, 0.0, &[("quality", 0.8)]),
            ]))
            .unwrap();
        assert_eq!(output.best_combination, "B");
        assert!((output.contribution["quality"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_single_minimized_criterion_picks_smaller_raw_value() {
        let strategy = build_selection_strategy(&config(
            &[AVERAGE_LATENCY],
            &[(AVERAGE_LATENCY, 1.0)],
            &[(AVERAGE_LATENCY, false)],
            None,
        ))
        .unwrap();
        let output = strategy
            .select(&experiment(vec![
                metrics("A", 0.0, 200.0, &[]),
                metrics("B", 0.0, 50.0, &[]),
            ]))
            .unwrap();
        assert_eq!(output.best_combination, "B");
        // Sign-flipped raw contribution for a minimized criterion.
        assert!((output.contribution[AVERAGE_LATENCY] + 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_min_max_trade_off_scenario() {
        // B is smallest on both minimized criteria and must win.
        let strategy = build_selection_strategy(&config(
            &[AVERAGE_TOKEN_USAGE, AVERAGE_LATENCY],
            &[(AVERAGE_TOKEN_USAGE, 0.5), (AVERAGE_LATENCY, 0.5)],
            &[(AVERAGE_TOKEN_USAGE, false), (AVERAGE_LATENCY, false)],
            Some(NormalizeMethod::MinMax),
        ))
        .unwrap();
        let output = strategy
            .select(&experiment(vec![
                metrics("A", 120.0, 200.0, &[]),
                metrics("B", 50.0, 50.0, &[]),
                metrics("C", 300.0, 300.0, &[]),
            ]))
            .unwrap();
        assert_eq!(output.best_combination, "B");
    }

    #[test]
    fn test_weight_increase_is_monotone_for_winner() {
        // X leads on `quality`; raising quality's weight must never unseat X.
        let combos = || {
            experiment(vec![
                metrics("X", 100.0, 0.0, &[("quality", 0.9)]),
                metrics("Y", 50.0, 0.0, &[("quality", 0.2)]),
            ])
        };
        for weight in [1.0, 2.0, 5.0, 10.0] {
            let strategy = build_selection_strategy(&config(
                &["quality", AVERAGE_TOKEN_USAGE],
                &[("quality", weight), (AVERAGE_TOKEN_USAGE, 0.5)],
                &[("quality", true), (AVERAGE_TOKEN_USAGE, false)],
                Some(NormalizeMethod::MinMax),
            ))
            .unwrap();
            let before = strategy.select(&combos()).unwrap();
            if before.best_combination == "X" {
                // Once X wins at some weight it keeps winning at higher ones.
                for higher in [weight * 2.0, weight * 4.0] {
                    let strategy = build_selection_strategy(&config(
                        &["quality", AVERAGE_TOKEN_USAGE],
                        &[("quality", higher), (AVERAGE_TOKEN_USAGE, 0.5)],
                        &[("quality", true), (AVERAGE_TOKEN_USAGE, false)],
                        Some(NormalizeMethod::MinMax),
                    ))
                    .unwrap();
                    assert_eq!(strategy.select(&combos()).unwrap().best_combination, "X");
                }
            }
        }
    }

    #[test]
    fn test_z_score_trade_off_prefers_balanced_combination() {
        // High elo but costly (C) loses to balanced B when cost weights bite.
        let strategy = build_selection_strategy(&config(
            &["elo", AVERAGE_TOKEN_USAGE, AVERAGE_LATENCY],
            &[("elo", 0.6), (AVERAGE_TOKEN_USAGE, 0.2), (AVERAGE_LATENCY, 0.2)],
            &[
                ("elo", true),
                (AVERAGE_TOKEN_USAGE, false),
                (AVERAGE_LATENCY, false),
            ],
            Some(NormalizeMethod::ZScore),
        ))
        .unwrap();
        let output = strategy
            .select(&experiment(vec![
                metrics("A", 120.0, 200.0, &[("elo", 1500.0)]),
                metrics("B", 50.0, 50.0, &[("elo", 1300.0)]),
                metrics("C", 300.0, 300.0, &[("elo", 1600.0)]),
            ]))
            .unwrap();
        assert_eq!(output.best_combination, "A");
    }

    #[test]
    fn test_missing_criterion_defaults_to_zero() {
        let strategy = build_selection_strategy(&config(
            &["missing_metric"],
            &[("missing_metric", 1.0)],
            &[],
            None,
        ))
        .unwrap();
        let output = strategy
            .select(&experiment(vec![metrics("A", 0.0, 0.0, &[])]))
            .unwrap();
        assert_eq!(output.best_combination, "A");
        assert_eq!(output.contribution["missing_metric"], 0.0);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let strategy = build_selection_strategy(&config(
            &["quality"],
            &[("quality", 1.0)],
            &[],
            None,
        ))
        .unwrap();
        let output = strategy
            .select(&experiment(vec![
                metrics("first", 0.0, 0.0, &[("quality", 0.5)]),
                metrics("second", 0.0, 0.0, &[("quality", 0.5)]),
            ]))
            .unwrap();
        assert_eq!(output.best_combination, "first");
    }

    #[test]
    fn test_empty_criteria_is_a_config_error() {
        let err = build_selection_strategy(&config(&[], &[], &[], None)).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
