//! Core engine for comparative LLM experimentation: enumerate variation
//! combinations, fan trials out concurrently, score them with pluggable
//! evaluators, aggregate per-combination metrics, and pick a winner with a
//! weighted multi-criteria selection strategy.

pub mod aggregate;
pub mod completion;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod json;
pub mod rate_limiter;
pub mod runner;
pub mod selection;
pub mod state;
pub mod types;
pub mod usage;
pub mod variation;

pub use aggregate::generate_experiment;
pub use completion::{CompletionClient, CompletionRequest, CompletionResponse};
pub use config::{ExperimentConfig, RunnerSettings};
pub use error::Error;
pub use evaluator::{
    ComparisonEvaluator, EvaluatorRef, EvaluatorRegistry, EvaluatorSet, EvaluatorType,
    GlobalEvaluator, IndividualEvaluator,
};
pub use executor::{TrialExecutor, TrialFunction};
pub use rate_limiter::RateLimiter;
pub use runner::ExperimentRunner;
pub use selection::{
    build_selection_strategy, NormalizeMethod, SelectionConfig, SelectionStrategy,
    AVERAGE_LATENCY, AVERAGE_TOKEN_USAGE,
};
pub use state::VariationState;
pub use types::{
    AggregationMethod, CombinationMetrics, EnhancerOutput, EvaluatorOutput, Experiment,
    GroupedResult, InputRecord, SelectionOutput, TrialOutput, TrialResult,
};
pub use usage::TokenMeter;
pub use variation::{Combination, ValueType, Variation, VariationGroup};
