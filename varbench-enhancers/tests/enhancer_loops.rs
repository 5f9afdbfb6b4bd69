//! End-to-end enhancer loop tests against deterministic stub services.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map};

use varbench_core::{
    CompletionClient, CompletionRequest, CompletionResponse, Error, EvaluatorOutput,
    EvaluatorRegistry, EvaluatorRef, EvaluatorType, ExperimentRunner, IndividualEvaluator,
    InputRecord, RunnerSettings, SelectionConfig, TokenMeter, TrialFunction, TrialOutput,
    TrialResult, ValueType, Variation, VariationGroup, VariationState, build_selection_strategy,
};
use varbench_enhancers::{
    CombinationEnhancer, EvolutionConfig, EvolutionaryEnhancer, OproConfig,
    OptimizeByPromptEnhancer,
};

/// Emits the active `task` variation verbatim as the trial output.
struct EchoTaskFunction;

#[async_trait]
impl TrialFunction for EchoTaskFunction {
    async fn call(
        &self,
        _input: &InputRecord,
        state: &VariationState,
        meter: &TokenMeter,
    ) -> Result<TrialOutput, Error> {
        meter.record(3);
        let task = state
            .next_variation("task")
            .and_then(|v| v.instantiated_value.as_str().map(str::to_string))
            .unwrap_or_default();
        Ok(TrialOutput::text(task))
    }
}

/// Scores each output from a fixed text → score table.
struct TableEvaluator {
    scores: HashMap<String, f64>,
}

#[async_trait]
impl IndividualEvaluator for TableEvaluator {
    fn name(&self) -> &str {
        "quality"
    }

    async fn evaluate(&self, result: &TrialResult) -> Result<Option<EvaluatorOutput>, Error> {
        let score = result
            .raw_output
            .text
            .as_deref()
            .and_then(|text| self.scores.get(text))
            .copied()
            .unwrap_or(0.0);
        Ok(Some(EvaluatorOutput::new("quality", json!(score))))
    }
}

/// Replays a scripted sequence of completion responses; the last response
/// repeats once the script runs out.
struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
    last: String,
}

impl ScriptedClient {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            last: responses.last().unwrap().to_string(),
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, Error> {
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.last.clone());
        Ok(CompletionResponse {
            text,
            token_count: 10,
        })
    }
}

fn table(entries: &[(&str, f64)]) -> HashMap<String, f64> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn quality_runner(scores: HashMap<String, f64>) -> ExperimentRunner {
    let mut registry = EvaluatorRegistry::new();
    registry.register_individual(Arc::new(TableEvaluator { scores }));
    let evaluators = registry
        .resolve(&[EvaluatorRef {
            name: "quality".to_string(),
            evaluator_type: EvaluatorType::Individual,
        }])
        .unwrap();

    let selection = SelectionConfig {
        strategy: "ahp_selection".to_string(),
        criteria: vec!["quality".to_string()],
        weights: [("quality".to_string(), 1.0)].into_iter().collect(),
        maximize: HashMap::new(),
        normalize: None,
    };

    let mut content = Map::new();
    content.insert("question".to_string(), json!("write a headline"));
    let data = vec![
        InputRecord::new("1", content.clone()),
        InputRecord::new("2", content),
    ];

    let mut runner = ExperimentRunner::new(
        Arc::new(EchoTaskFunction),
        evaluators,
        data,
        RunnerSettings {
            concurrency: 4,
            max_rate: 100_000.0,
            progress: false,
        },
    )
    .with_strategy(build_selection_strategy(&selection).unwrap());
    runner.set_groups(vec![VariationGroup::new(
        "task",
        vec![Variation::new(ValueType::Str, json!("v1")).unwrap()],
    )]);
    runner
}

/// Hill-climb convergence scaffold: with a stubbed service proposing ever
/// better candidates scored 0.2 → 0.5 → 0.9, three iterations must leave the
/// best candidate at 0.9 while keeping every iteration's metrics in the
/// output.
#[tokio::test]
async fn test_opro_converges_and_keeps_all_iterations() -> anyhow::Result<()> {
    let mut runner = quality_runner(table(&[("v1", 0.2), ("v2", 0.5), ("v3", 0.9)]));
    let seed_experiment = runner.run(true).await?;

    let enhancer = OptimizeByPromptEnhancer::new(OproConfig {
        head_meta_instruction: "Here are previous solutions and their scores.".to_string(),
        end_meta_instruction: "Write a solution scoring strictly higher.".to_string(),
        optimization_task_format: None,
        enhance_var: vec!["task".to_string()],
        model: "stub".to_string(),
        max_iterations: 2,
    });
    let client = Arc::new(ScriptedClient::new(&["task=v2", "task=v3"]));

    let output = enhancer.enhance(&seed_experiment, &mut runner, client).await?;

    // All three iterations' combinations survive in the union.
    assert_eq!(output.combination_metrics.len(), 3);
    for candidate in ["v1", "v2", "v3"] {
        assert!(
            output
                .combination_metrics
                .iter()
                .any(|m| m.combo_key.contains(candidate)),
            "missing combination for {candidate}"
        );
    }

    assert!(output.original_best_combo_key.contains("v1"));
    let selection = output.selection_output.expect("final selection output");
    assert!(selection.best_combination.contains("v3"));
    assert!((selection.contribution["quality"] - 0.9).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_opro_requires_selected_experiment() {
    let mut runner = quality_runner(table(&[("v1", 0.2)]));
    // Selection disabled: the seed experiment carries no best combination.
    let seed_experiment = runner.run(false).await.unwrap();

    let enhancer = OptimizeByPromptEnhancer::new(OproConfig {
        head_meta_instruction: String::new(),
        end_meta_instruction: String::new(),
        optimization_task_format: None,
        enhance_var: vec!["task".to_string()],
        model: "stub".to_string(),
        max_iterations: 1,
    });
    let client = Arc::new(ScriptedClient::new(&["task=v2"]));

    let err = enhancer
        .enhance(&seed_experiment, &mut runner, client)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Selection { .. }));
}

#[tokio::test]
async fn test_opro_survives_unparseable_proposals() {
    let mut runner = quality_runner(table(&[("v1", 0.2), ("v2", 0.6)]));
    let seed_experiment = runner.run(true).await.unwrap();

    let enhancer = OptimizeByPromptEnhancer::new(OproConfig {
        head_meta_instruction: String::new(),
        end_meta_instruction: String::new(),
        optimization_task_format: None,
        enhance_var: vec!["task".to_string()],
        model: "stub".to_string(),
        max_iterations: 1,
    });
    // Every proposal is garbage: the loop retries, gives up, and re-scores
    // the seed candidate instead of aborting.
    let client = Arc::new(ScriptedClient::new(&["no variables here at all"]));

    let output = enhancer
        .enhance(&seed_experiment, &mut runner, client)
        .await
        .unwrap();
    assert_eq!(output.combination_metrics.len(), 1);
    assert!(output.combination_metrics[0].combo_key.contains("v1"));
}

/// Evolutionary search over a scripted population: seeding grows the
/// population, crossover and mutation produce new candidates, and the best
/// mutant wins the final selection.
#[tokio::test]
async fn test_evolution_promotes_best_mutant() {
    let mut runner = quality_runner(table(&[
        ("v1", 0.1),
        ("v2", 0.2),
        ("v4", 0.8),
        ("v5", 0.4),
    ]));
    let seed_experiment = runner.run(true).await.unwrap();

    let enhancer = EvolutionaryEnhancer::new(EvolutionConfig {
        init: Vec::new(),
        dev: Vec::new(),
        enhance_var: vec!["task".to_string()],
        model: "stub".to_string(),
        max_iterations: 1,
        population: 2,
    });
    let client = Arc::new(ScriptedClient::new(&[
        // Seeding: grow the population from v1 to two candidates.
        "task=v2",
        // Crossover: two children, each distinct from both parents.
        "task=c1",
        "task=c2",
        // Mutation of each child.
        "task=v4",
        "task=v5",
    ]));

    let output = enhancer
        .enhance(&seed_experiment, &mut runner, client)
        .await
        .unwrap();

    for candidate in ["v1", "v2", "v4", "v5"] {
        assert!(
            output
                .combination_metrics
                .iter()
                .any(|m| m.combo_key.contains(candidate)),
            "missing combination for {candidate}"
        );
    }
    assert!(output.original_best_combo_key.contains("v1"));
    let selection = output.selection_output.expect("final selection output");
    assert!(selection.best_combination.contains("v4"));
}

/// With a dev set configured, candidates are ranked by text similarity to the
/// references instead of by live evaluator score.
#[tokio::test]
async fn test_evolution_dev_set_scoring_prefers_similar_output() {
    // The evaluator table is empty: live scores would all be 0.
    let mut runner = quality_runner(table(&[("v1", 0.5)]));
    let seed_experiment = runner.run(true).await.unwrap();

    let enhancer = EvolutionaryEnhancer::new(EvolutionConfig {
        init: Vec::new(),
        dev: vec!["exact reference text".to_string(), "exact reference text".to_string()],
        enhance_var: vec!["task".to_string()],
        model: "stub".to_string(),
        max_iterations: 1,
        population: 2,
    });
    let client = Arc::new(ScriptedClient::new(&[
        "task=unrelated words entirely",
        "task=c1",
        "task=c2",
        "task=exact reference text",
        "task=other words",
    ]));

    let output = enhancer
        .enhance(&seed_experiment, &mut runner, client)
        .await
        .unwrap();
    assert!(output
        .combination_metrics
        .iter()
        .any(|m| m.combo_key.contains("exact reference text")));
}
