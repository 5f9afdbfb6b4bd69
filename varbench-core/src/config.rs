//! Declarative experiment configuration.
//!
//! Config is TOML-loadable and validated eagerly: unknown evaluator or
//! strategy names, empty criteria lists, and malformed variation values are
//! all rejected before any trial executes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::evaluator::{EvaluatorRef, EvaluatorRegistry};
use crate::selection::{build_selection_strategy, SelectionConfig};
use crate::variation::{ValueType, Variation, VariationGroup};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariationCandidateConfig {
    pub value_type: ValueType,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariationGroupConfig {
    pub name: String,
    pub candidates: Vec<VariationCandidateConfig>,
}

impl VariationGroupConfig {
    pub fn build(&self) -> Result<VariationGroup, Error> {
        let candidates = self
            .candidates
            .iter()
            .map(|c| Variation::new(c.value_type, c.value.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VariationGroup::new(self.name.clone(), candidates))
    }
}

/// Fan-out and pacing settings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerSettings {
    /// Maximum concurrent (input × combination-set) tasks.
    pub concurrency: usize,
    /// External call pacing, in calls per second.
    pub max_rate: f64,
    /// Show a progress bar while a pass runs.
    pub progress: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_rate: 10.0,
            progress: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub description: String,
    #[serde(default)]
    pub variations: Vec<VariationGroupConfig>,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorRef>,
    #[serde(default)]
    pub selection: Option<SelectionConfig>,
    #[serde(default)]
    pub runner: RunnerSettings,
}

impl ExperimentConfig {
    pub fn load_from_str(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::load_from_str(&raw)
    }

    /// Resolves every name reference against the registry and instantiates
    /// every variation value, so misconfiguration fails here rather than
    /// mid-run.
    pub fn validate(&self, registry: &EvaluatorRegistry) -> Result<(), Error> {
        registry.resolve(&self.evaluators)?;
        if let Some(selection) = &self.selection {
            build_selection_strategy(selection)?;
        }
        for group in &self.variations {
            group.build()?;
        }
        if self.runner.concurrency == 0 {
            return Err(Error::config("runner concurrency must be at least 1"));
        }
        if self.runner.max_rate <= 0.0 {
            return Err(Error::config("runner max_rate must be positive"));
        }
        Ok(())
    }

    pub fn build_groups(&self) -> Result<Vec<VariationGroup>, Error> {
        self.variations.iter().map(VariationGroupConfig::build).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvaluatorRegistry;

    const SAMPLE: &str = r#"
description = "headline generation"

[[variations]]
name = "task"

[[variations.candidates]]
value_type = "str"
value = "write a headline"

[[variations.candidates]]
value_type = "str"
value = "write a catchy headline"

[[evaluators]]
name = "expected_match"
evaluator_type = "individual"

[selection]
criteria = ["expected_match", "average_latency"]
normalize = "min-max"

[selection.weights]
expected_match = 0.8
average_latency = 0.2

[selection.maximize]
expected_match = true
average_latency = false

[runner]
concurrency = 8
max_rate = 5.0
progress = false
"#;

    #[test]
    fn test_loads_and_validates_sample_config() {
        let config = ExperimentConfig::load_from_str(SAMPLE).unwrap();
        config.validate(&EvaluatorRegistry::new()).unwrap();
        assert_eq!(config.variations.len(), 1);
        let groups = config.build_groups().unwrap();
        assert_eq!(groups[0].candidates.len(), 2);
        assert_eq!(config.runner.concurrency, 8);
    }

    #[test]
    fn test_unknown_evaluator_name_fails_validation() {
        let mut config = ExperimentConfig::load_from_str(SAMPLE).unwrap();
        config.evaluators[0].name = "nope".to_string();
        assert!(config.validate(&EvaluatorRegistry::new()).is_err());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(ExperimentConfig::load_from_str("description = \"x\"\nunknown_field = 1").is_err());
    }
}
