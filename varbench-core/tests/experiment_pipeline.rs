//! Config-to-selection pipeline test: a declarative TOML config drives a
//! full experiment pass against a deterministic trial function.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map};

use varbench_core::{
    Error, EvaluatorRegistry, ExperimentConfig, ExperimentRunner, InputRecord, TokenMeter,
    TrialFunction, TrialOutput, VariationState, build_selection_strategy,
};

const CONFIG: &str = r#"
description = "uppercase style comparison"

[[variations]]
name = "style"

[[variations.candidates]]
value_type = "str"
value = "plain"

[[variations.candidates]]
value_type = "str"
value = "upper"

[[evaluators]]
name = "expected_match"
evaluator_type = "individual"

[selection]
criteria = ["expected_match"]

[selection.weights]
expected_match = 1.0

[runner]
concurrency = 4
max_rate = 100000.0
"#;

struct StyledEcho;

#[async_trait]
impl TrialFunction for StyledEcho {
    async fn call(
        &self,
        input: &InputRecord,
        state: &VariationState,
        meter: &TokenMeter,
    ) -> Result<TrialOutput, Error> {
        let word = input
            .content
            .get("word")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        meter.record(word.len() as u64);
        let styled = match state
            .next_variation("style")
            .and_then(|v| v.instantiated_value.as_str().map(str::to_string))
            .as_deref()
        {
            Some("upper") => word.to_uppercase(),
            _ => word.to_string(),
        };
        Ok(TrialOutput::text(styled))
    }
}

#[tokio::test]
async fn test_config_driven_pass_selects_matching_style() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = ExperimentConfig::load_from_str(CONFIG)?;
    let registry = EvaluatorRegistry::new();
    config.validate(&registry)?;

    let evaluators = registry.resolve(&config.evaluators)?;
    let strategy = build_selection_strategy(config.selection.as_ref().unwrap())?;

    let data: Vec<InputRecord> = ["alpha", "beta"]
        .iter()
        .enumerate()
        .map(|(i, word)| {
            let mut content = Map::new();
            content.insert("word".to_string(), json!(word));
            InputRecord::new((i + 1).to_string(), content)
                .with_expected(json!(word.to_uppercase()))
        })
        .collect();

    let mut runner = ExperimentRunner::new(
        Arc::new(StyledEcho),
        evaluators,
        data,
        config.runner.clone(),
    )
    .with_strategy(strategy);
    runner.set_groups(config.build_groups()?);

    let experiment = runner.run(true).await?;

    // 2 inputs × 2 styles, grouped both ways.
    assert_eq!(experiment.grouped_results.len(), 2);
    assert_eq!(experiment.combination_metrics.len(), 2);
    for metrics in &experiment.combination_metrics {
        assert_eq!(metrics.results.len(), 2);
        assert!(metrics.average_token_usage > 0.0);
    }

    let selection = experiment.selection_output.expect("selection output");
    assert!(selection.best_combination.contains("upper"));
    assert!((selection.total_score() - 1.0).abs() < 1e-12);
    Ok(())
}
