//! Error types for the textcall adapter.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the adapter.
#[derive(Error, Debug)]
pub enum Error {
    /// API errors (generic)
    #[error("API error: {0}")]
    Api(String),

    /// The underlying model hit its maximum-turns ceiling.
    #[error("Model {model} hit the maximum turn limit")]
    TurnLimit { model: String },

    /// The underlying model reported an internal failure during generation.
    #[error("Model {model} failed during execution: {message}")]
    Execution { model: String, message: String },

    /// Unexpected failure while invoking the underlying model.
    #[error("Invoking model {model} failed: {message}")]
    Invocation { model: String, message: String },
}

impl Error {
    /// Create an API error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    /// Create a turn-limit error for the given model.
    pub fn turn_limit(model: impl Into<String>) -> Self {
        Self::TurnLimit {
            model: model.into(),
        }
    }

    /// Create an execution error for the given model.
    pub fn execution(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Wrap an invocation failure with the model identifier.
    pub fn invocation(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invocation {
            model: model.into(),
            message: message.into(),
        }
    }
}
