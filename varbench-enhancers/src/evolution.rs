//! Population-based evolutionary search: roulette-wheel parent selection,
//! LLM-mediated crossover and mutation, and top-N survival per generation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use varbench_core::{
    generate_experiment, CompletionClient, EnhancerOutput, Error, Experiment, ExperimentRunner,
    TrialResult,
};

use crate::parse::{
    extract_placeholders, extract_variations, render_input, render_output_format,
    render_placeholder_restriction,
};
use crate::similarity::mean_unigram_f1;
use crate::{
    collect_input_records, fetch_response, find_combo_with_score, find_origin_combo_key,
    groups_from_candidate,
};

const EPSILON: f64 = 1e-10;

/// Bounded generate-until-different attempts, as a multiple of the requested
/// count. The service occasionally parrots its input back.
const ATTEMPT_FACTOR: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Explicit seed candidates, rendered as `var=value` blocks. When empty,
    /// the population is grown from the current best combination.
    #[serde(default)]
    pub init: Vec<String>,
    /// Reference outputs. When present, candidates are scored by text
    /// similarity against these instead of by live selection score.
    #[serde(default)]
    pub dev: Vec<String>,
    pub enhance_var: Vec<String>,
    pub model: String,
    pub max_iterations: usize,
    pub population: usize,
}

#[derive(Debug, Clone)]
struct Candidate {
    text: String,
    score: f64,
}

pub struct EvolutionaryEnhancer {
    config: EvolutionConfig,
}

impl EvolutionaryEnhancer {
    pub fn new(config: EvolutionConfig) -> Self {
        Self { config }
    }

    fn seed_prompt(&self, prompt: &str, placeholders: &[String]) -> String {
        let mut full = format!(
            "Please read the Large Language Model prompt following the <prompt> tag and try \
             to understand what its task is. Then respond with a new, robust prompt which \
             will generate a better response to the task. Only return that prompt. Do not \
             include a <prompt> tag.\n<prompt>\n{prompt}\n"
        );
        if !placeholders.is_empty() {
            full.push_str(&render_placeholder_restriction(placeholders));
        }
        full.push_str(&render_output_format(&self.config.enhance_var));
        full
    }

    fn crossover_prompt(&self, parent_1: &str, parent_2: &str) -> String {
        format!(
            "Given the following two parent prompts which come after the <prompt> tag, \
             create a new prompt by crossing over or combining portions of the parents. \
             The new prompt should convey the same idea and accomplish the same task as \
             the parents. Do not include the <prompt> tag.\n<prompt>\n\
             Prompt 1: {parent_1}\n\nPrompt 2: {parent_2}\n"
        )
    }

    fn mutate_prompt(&self, prompt: &str, placeholders: &[String]) -> String {
        let mut full = format!(
            "Please read the prompt following the <prompt> tag and rewrite it in a way \
             that is different than the original. You can add or remove portions. Replace \
             words with synonyms and antonyms. Only respond with a prompt. Do not include \
             the <prompt> tag or anything before or after the prompt.\n<prompt>\n{prompt}\n"
        );
        if !placeholders.is_empty() {
            full.push_str(&render_placeholder_restriction(placeholders));
        }
        full.push_str(&render_output_format(&self.config.enhance_var));
        full
    }

    /// Grows the population to the configured size from the seed candidates,
    /// keeping only responses that differ from everything already present.
    async fn grow_seed_population(
        &self,
        client: &Arc<dyn CompletionClient>,
        seeds: Vec<String>,
        placeholders: &[String],
    ) -> Result<Vec<String>, Error> {
        let mut prompts = seeds;
        let seed = prompts[0].clone();
        let prompt = self.seed_prompt(&seed, placeholders);
        let mut attempts = 0;
        while prompts.len() < self.config.population && attempts < self.config.population * ATTEMPT_FACTOR
        {
            attempts += 1;
            let response = fetch_response(client, &self.config.model, prompt.clone()).await?;
            let parsed = extract_variations(&response, &self.config.enhance_var);
            if parsed.is_empty() {
                continue;
            }
            let rendered = render_input(&parsed, &self.config.enhance_var);
            if !prompts.contains(&rendered) {
                prompts.push(rendered);
            }
        }
        if prompts.len() < self.config.population {
            warn!(
                have = prompts.len(),
                want = self.config.population,
                "seed population came up short, continuing with what parsed"
            );
        }
        Ok(prompts)
    }

    /// Roulette-wheel sampling of two distinct parents with probability
    /// proportional to min-max-normalized score. With two or fewer candidates
    /// the wheel degenerates to taking the first two.
    fn select_parents(&self, population: &[Candidate], rng: &mut StdRng) -> (String, String) {
        if population.len() <= 2 {
            let first = population[0].text.clone();
            let second = population.get(1).map_or_else(|| first.clone(), |c| c.text.clone());
            return (first, second);
        }
        let min = population.iter().map(|c| c.score).fold(f64::INFINITY, f64::min);
        let max = population
            .iter()
            .map(|c| c.score)
            .fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = population
            .iter()
            .map(|c| (c.score - min) / (max - min + EPSILON))
            .collect();

        let first = spin_wheel(&weights, None, rng);
        let second = spin_wheel(&weights, Some(first), rng);
        (population[first].text.clone(), population[second].text.clone())
    }

    /// Runs one candidate through a full experiment pass and scores it.
    /// Returns `None` for candidates that parse to nothing or produce no
    /// score, along with the pass's experiment when one ran.
    async fn score_candidate(
        &self,
        text: &str,
        base: &HashMap<String, String>,
        group_order: &[String],
        runner: &mut ExperimentRunner,
    ) -> Result<Option<(f64, Experiment)>, Error> {
        let parsed = extract_variations(text, &self.config.enhance_var);
        if parsed.is_empty() {
            warn!("dropping unparseable candidate");
            return Ok(None);
        }
        let mut candidate = base.clone();
        candidate.extend(parsed);
        runner.set_groups(groups_from_candidate(&candidate, group_order)?);
        let experiment = runner.run(true).await?;

        let score = if self.config.dev.is_empty() {
            match &experiment.selection_output {
                Some(selection) => selection.total_score(),
                None => {
                    warn!("candidate produced no selection output, ranking it last");
                    return Ok(Some((f64::NEG_INFINITY, experiment)));
                }
            }
        } else {
            let predictions: Vec<String> = experiment
                .grouped_results
                .iter()
                .filter_map(|group| {
                    group
                        .results
                        .first()
                        .and_then(|result| result.raw_output.text.clone())
                })
                .collect();
            mean_unigram_f1(&predictions, &self.config.dev)
        };
        Ok(Some((score, experiment)))
    }
}

fn spin_wheel(weights: &[f64], exclude: Option<usize>, rng: &mut StdRng) -> usize {
    let total: f64 = weights
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != exclude)
        .map(|(_, w)| w)
        .sum();
    if total <= 0.0 {
        // Constant scores degenerate to uniform choice.
        let eligible: Vec<usize> =
            (0..weights.len()).filter(|i| Some(*i) != exclude).collect();
        return eligible[rng.random_range(0..eligible.len())];
    }
    let mut spin = rng.random_range(0.0..total);
    for (index, weight) in weights.iter().enumerate() {
        if Some(index) == exclude {
            continue;
        }
        if spin < *weight {
            return index;
        }
        spin -= weight;
    }
    // Floating-point residue; fall back to the last eligible index.
    (0..weights.len()).rev().find(|i| Some(*i) != exclude).unwrap_or(0)
}

#[async_trait]
impl super::CombinationEnhancer for EvolutionaryEnhancer {
    fn name(&self) -> &str {
        "evolutionary"
    }

    #[instrument(skip_all, fields(generations = self.config.max_iterations, population = self.config.population))]
    async fn enhance(
        &self,
        experiment: &Experiment,
        runner: &mut ExperimentRunner,
        client: Arc<dyn CompletionClient>,
    ) -> Result<EnhancerOutput, Error> {
        let original_best_combo_key = find_origin_combo_key(experiment)?;
        let (base, _) = find_combo_with_score(experiment)?;
        for var in &self.config.enhance_var {
            if !base.contains_key(var) {
                return Err(Error::config(format!(
                    "enhance_var `{var}` is not part of the best combination"
                )));
            }
        }
        let group_order: Vec<String> = base.keys().cloned().collect();
        let placeholders: Vec<String> = self
            .config
            .enhance_var
            .iter()
            .filter_map(|var| base.get(var))
            .flat_map(|value| extract_placeholders(value))
            .collect();

        runner.set_data(collect_input_records(experiment));
        let mut rng = StdRng::from_os_rng();
        let mut experiments: Vec<Experiment> = Vec::new();

        let init_prompt = render_input(&base, &self.config.enhance_var);
        let seeds = if self.config.init.is_empty() {
            vec![init_prompt.clone()]
        } else {
            self.config.init.clone()
        };
        let seed_texts = self
            .grow_seed_population(&client, seeds, &placeholders)
            .await?;

        let mut population: Vec<Candidate> = Vec::new();
        for text in seed_texts {
            if let Some((score, exp)) = self
                .score_candidate(&text, &base, &group_order, runner)
                .await?
            {
                experiments.push(exp);
                population.push(Candidate { text, score });
            }
        }
        if population.is_empty() {
            return Err(Error::NoCandidate);
        }

        let mut incumbent = init_prompt;

        for generation in 0..self.config.max_iterations {
            info!(generation, population = population.len(), "starting generation");

            let (parent_1, parent_2) = self.select_parents(&population, &mut rng);

            // Crossover until the child differs from both parents, up to
            // `population` children.
            let crossover_prompt = self.crossover_prompt(&parent_1, &parent_2);
            let mut children = Vec::new();
            let mut attempts = 0;
            while children.len() < self.config.population
                && attempts < self.config.population * ATTEMPT_FACTOR
            {
                attempts += 1;
                let content =
                    fetch_response(&client, &self.config.model, crossover_prompt.clone()).await?;
                if content != parent_1 && content != parent_2 {
                    children.push(content);
                }
            }

            // Mutation rewrites each child; a rewrite identical to its source
            // is discarded.
            let mut mutated = Vec::new();
            for child in &children {
                let content = fetch_response(
                    &client,
                    &self.config.model,
                    self.mutate_prompt(child, &placeholders),
                )
                .await?;
                if content != *child {
                    mutated.push(content);
                }
            }

            for text in mutated {
                if population.iter().any(|c| c.text == text) {
                    continue;
                }
                if let Some((score, exp)) = self
                    .score_candidate(&text, &base, &group_order, runner)
                    .await?
                {
                    experiments.push(exp);
                    population.push(Candidate { text, score });
                }
            }

            // Survival of the top `population` by score.
            population.sort_by(|a, b| b.score.total_cmp(&a.score));
            population.truncate(self.config.population);

            let generation_best = population
                .iter()
                .max_by(|a, b| a.score.total_cmp(&b.score))
                .map(|c| c.text.clone())
                .unwrap_or_default();
            if incumbent != generation_best {
                incumbent = generation_best;
            } else {
                // Force a textual difference so the next generation's prompts
                // never see an exact repeat of the incumbent.
                incumbent.push('\n');
            }

            if let Some((score, exp)) = self
                .score_candidate(&incumbent, &base, &group_order, runner)
                .await?
            {
                info!(generation, score, "incumbent rescored");
                experiments.push(exp);
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
