//! Provider abstraction for tool-calling completions.
//!
//! This module defines the provider trait and common request types. The
//! adapter in [`crate::adapter`] implements [`Provider`] on top of a
//! plain-text model channel.

use crate::error::Result;
use crate::model::{AssistantMessage, Message, StreamEvent};
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Boxed event stream returned by [`Provider::stream`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

// ============================================================================
// Provider Trait
// ============================================================================

/// A provider for tool-calling completions.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Get the API type.
    fn api(&self) -> &str;

    /// Get the model identifier used by this provider.
    fn model_id(&self) -> &str;

    /// Stream a completion.
    async fn stream(&self, context: &Context, options: &StreamOptions) -> Result<EventStream>;

    /// Run a completion to completion and return the folded result.
    async fn generate(&self, context: &Context, options: &StreamOptions) -> Result<Completion>;
}

// ============================================================================
// Context
// ============================================================================

/// Context for a completion request.
///
/// Owned by the caller; the adapter only reads it.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

// ============================================================================
// Tool Definition
// ============================================================================

/// A tool definition.
///
/// `parameters` is a JSON-Schema object; its `required` list is rendered
/// verbatim into the tool protocol prompt.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ============================================================================
// Stream Options
// ============================================================================

/// Options for a completion call.
///
/// The session fields carry the continuity data returned in
/// [`crate::model::SessionMeta`] on the previous call. Leaving
/// `last_processed_message_count`/`message_fingerprints` unset while
/// supplying a `session_id` opts out of precise tracking; the adapter then
/// replays only the most recent user turn.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Session to resume, as reported by the underlying model.
    pub session_id: Option<String>,
    /// How many history messages the resumed session has already seen.
    pub last_processed_message_count: Option<usize>,
    /// Fingerprints recorded for the already-seen history prefix.
    pub message_fingerprints: Option<Vec<String>>,
    /// Thinking-token ceiling passed through to the underlying model.
    pub max_thinking_tokens: Option<u32>,
    /// Cooperative cancellation for the in-flight call.
    pub cancel: Option<CancellationToken>,
}

// ============================================================================
// Batch Result
// ============================================================================

/// Result of a batch [`Provider::generate`] call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub message: AssistantMessage,
    /// Header-style metadata (`x-session-id`, `x-message-count`,
    /// `x-message-fingerprints`, `x-session-forced-new`).
    pub metadata: HashMap<String, String>,
}
