//! Abstraction over the underlying plain-text model.
//!
//! The model being adapted accepts a prompt string and produces a stream of
//! text and thinking deltas plus a terminal result; it has no notion of
//! structured tool calls. In production this is backed by a CLI subprocess;
//! tests drive the adapter with a scripted implementation.

use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Boxed upstream event stream returned by [`TextModel::stream`].
pub type TextEventStream = Pin<Box<dyn Stream<Item = Result<TextModelEvent>> + Send>>;

/// The plain-text model channel the adapter drives.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Model identifier, used in error messages and result metadata.
    fn model_id(&self) -> &str;

    /// Start one model invocation.
    async fn stream(&self, request: TextRequest) -> Result<TextEventStream>;
}

/// One invocation of the underlying model.
#[derive(Debug, Clone, Default)]
pub struct TextRequest {
    pub system_prompt: Option<String>,
    /// Serialized conversation tail (see [`crate::history`]).
    pub prompt: String,
    /// Server-side session to resume; `None` starts a fresh session.
    pub resume_session_id: Option<String>,
    pub max_thinking_tokens: Option<u32>,
}

/// Ordered events produced by the underlying model.
#[derive(Debug, Clone)]
pub enum TextModelEvent {
    /// The model opened (or resumed) a session.
    SessionStart { session_id: String },
    /// Incremental thinking/reasoning output.
    ThinkingDelta { delta: String },
    /// Incremental visible text output.
    TextDelta { delta: String },
    /// Normal terminal event; exactly one per successful invocation.
    Completed { stop: TextStop, usage: TextUsage },
    /// Provider-reported terminal failure.
    Failed { kind: FailureKind, message: String },
}

/// Why the underlying model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextStop {
    EndTurn,
    MaxTokens,
}

/// Provider-reported terminal failure subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The conversation hit the maximum-turns ceiling.
    TurnLimit,
    /// Internal failure during generation.
    Execution,
}

/// Token usage as reported by the underlying model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}
