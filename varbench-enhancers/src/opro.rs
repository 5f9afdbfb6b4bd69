//! Hill-climb search in the Optimization-by-PROmpting style: one candidate
//! is carried per iteration, and the proposal prompt shows the completion
//! service a bounded window of previous (candidate, score) pairs so it can
//! extrapolate a strictly better one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use varbench_core::{
    generate_experiment, CompletionClient, EnhancerOutput, Error, Experiment, ExperimentRunner,
    TrialResult, AVERAGE_LATENCY, AVERAGE_TOKEN_USAGE,
};

use crate::parse::{render_input, render_output_format};
use crate::{
    collect_input_records, find_combo_with_score, find_origin_combo_key, groups_from_candidate,
    propose_variations,
};

/// How many (candidate, score) pairs the proposal prompt shows. Older pairs
/// fall out of the window to keep the prompt bounded.
const HISTORY_WINDOW: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OproConfig {
    /// Fixed instruction opening every proposal prompt.
    pub head_meta_instruction: String,
    /// Fixed instruction closing every proposal prompt, before the output
    /// format block.
    pub end_meta_instruction: String,
    #[serde(default)]
    pub optimization_task_format: Option<String>,
    /// The variable names the search rewrites.
    pub enhance_var: Vec<String>,
    pub model: String,
    pub max_iterations: usize,
}

pub struct OptimizeByPromptEnhancer {
    config: OproConfig,
}

impl OptimizeByPromptEnhancer {
    pub fn new(config: OproConfig) -> Self {
        Self { config }
    }

    /// Renders the bounded history window as alternating Input/Evaluation
    /// blocks. Cost metrics are withheld from the prompt so the service
    /// optimizes quality criteria only.
    fn render_history(&self, cache: &[(HashMap<String, String>, HashMap<String, f64>)]) -> String {
        let start = cache.len().saturating_sub(HISTORY_WINDOW);
        let mut prompt = String::new();
        for (candidate, scores) in &cache[start..] {
            prompt.push_str("Input:\n");
            prompt.push_str(&render_input(candidate, &self.config.enhance_var));
            prompt.push_str("Evaluation:\n");
            for (name, score) in scores {
                let display = name.rsplit(':').next().unwrap_or(name).trim();
                if display == AVERAGE_TOKEN_USAGE || display == AVERAGE_LATENCY {
                    continue;
                }
                prompt.push_str(&format!("{display}: {score} "));
            }
            prompt.push('\n');
        }
        prompt
    }

    fn render_full_prompt(
        &self,
        cache: &[(HashMap<String, String>, HashMap<String, f64>)],
    ) -> String {
        let mut prompt = format!("{}\n", self.config.head_meta_instruction);
        prompt.push_str(&self.render_history(cache));
        prompt.push('\n');
        if let Some(task_format) = &self.config.optimization_task_format {
            prompt.push_str(task_format);
            prompt.push('\n');
        }
        prompt.push_str(&self.config.end_meta_instruction);
        prompt.push('\n');
        prompt.push_str(&render_output_format(&self.config.enhance_var));
        prompt
    }
}

#[async_trait]
impl super::CombinationEnhancer for OptimizeByPromptEnhancer {
    fn name(&self) -> &str {
        "optimize_by_prompt"
    }

    #[instrument(skip_all, fields(max_iterations = self.config.max_iterations))]
    async fn enhance(
        &self,
        experiment: &Experiment,
        runner: &mut ExperimentRunner,
        client: Arc<dyn CompletionClient>,
    ) -> Result<EnhancerOutput, Error> {
        let original_best_combo_key = find_origin_combo_key(experiment)?;
        let (best_combo, _) = find_combo_with_score(experiment)?;
        for var in &self.config.enhance_var {
            if !best_combo.contains_key(var) {
                return Err(Error::config(format!(
                    "enhance_var `{var}` is not part of the best combination"
                )));
            }
        }
        let group_order: Vec<String> = best_combo.keys().cloned().collect();

        runner.set_data(collect_input_records(experiment));

        let mut candidate = best_combo;
        let mut cache: Vec<(HashMap<String, String>, HashMap<String, f64>)> = Vec::new();
        let mut experiments: Vec<Experiment> = Vec::new();

        // Iteration 0 scores the seed itself; proposals start from there.
        for iteration in 0..=self.config.max_iterations {
            info!(iteration, "scoring current candidate");
            runner.set_groups(groups_from_candidate(&candidate, &group_order)?);
            let scored = runner.run(true).await?;

            match find_combo_with_score(&scored) {
                Ok((combo, scores)) => cache.push((combo, scores)),
                Err(e) => warn!(iteration, "candidate produced no selection, skipping it: {e}"),
            }
            experiments.push(scored);

            if iteration == self.config.max_iterations {
                break;
            }

            let prompt = self.render_full_prompt(&cache);
            match propose_variations(&client, &self.config.model, &prompt, &self.config.enhance_var)
                .await?
            {
                Some(proposed) => {
                    info!(iteration, "carrying forward proposed candidate");
                    // Only the enhanced variables move; the rest of the
                    // combination stays pinned.
                    candidate.extend(proposed);
                }
                None => warn!(iteration, "keeping previous candidate after failed proposals"),
            }
        }

        let all_results: Vec<TrialResult> = experiments
            .iter()
            .flat_map(|exp| exp.all_results().cloned())
            .collect();
        let mut combined =
            generate_experiment(all_results, runner.evaluators(), false, false).await;
        runner.apply_selection(&mut combined);

        Ok(EnhancerOutput {
            grouped_results: combined.grouped_results,
            combination_metrics: combined.combination_metrics,
            original_best_combo_key,
            selection_output: combined.selection_output,
        })
    }
}
