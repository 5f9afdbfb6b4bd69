use thiserror::Error;

/// Errors produced by the experiment engine.
///
/// Only `Config` errors are expected to abort a run; everything else is
/// recovered locally (a failed trial is dropped, a failed evaluator is
/// skipped, a malformed proposal is retried) and surfaced through logs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("completion request failed: {message}")]
    Completion { message: String },

    #[error("trial failed for input `{input_id}`: {message}")]
    Trial { input_id: String, message: String },

    #[error("evaluator `{name}` failed: {message}")]
    Evaluator { name: String, message: String },

    #[error("selection failed: {message}")]
    Selection { message: String },

    #[error("no candidate could be extracted from the completion response")]
    NoCandidate,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn completion(message: impl Into<String>) -> Self {
        Error::Completion {
            message: message.into(),
        }
    }
}
