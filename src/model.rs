//! Message types, content blocks, and streaming events.
//!
//! These types are the shared wire format of the adapter:
//! - The assembler streams [`StreamEvent`] values that incrementally build an
//!   assistant reply.
//! - Callers persist [`Message`] values and replay them as conversation
//!   history on the next call.
//! - [`SessionMeta`] is the per-call session continuity payload the caller
//!   must round-trip into the next request's options.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============================================================================
// Message Types
// ============================================================================

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    /// Message authored by the user.
    User(UserMessage),
    /// Message authored by the assistant/model.
    ///
    /// Wrapped in [`Arc`] for cheap cloning during streaming – the streaming
    /// hot-path emits many events per token.
    Assistant(Arc<AssistantMessage>),
    /// Tool result produced by the host after executing a tool call.
    ///
    /// Wrapped in [`Arc`] for cheap cloning – tool results often contain
    /// large file contents and are cloned during replay and persistence.
    ToolResult(Arc<ToolResultMessage>),
}

/// A user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: UserContent,
    pub timestamp: i64,
}

/// User message content - either plain text or blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    /// Plain text content (common for interactive input).
    Text(String),
    /// Structured content blocks.
    Blocks(Vec<ContentBlock>),
}

/// An assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: String,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

/// A tool result message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
    pub timestamp: i64,
}

impl Message {
    /// Convenience constructor: wraps an [`AssistantMessage`] in [`Arc`].
    pub fn assistant(msg: AssistantMessage) -> Self {
        Self::Assistant(Arc::new(msg))
    }

    /// Convenience constructor: wraps a [`ToolResultMessage`] in [`Arc`].
    pub fn tool_result(msg: ToolResultMessage) -> Self {
        Self::ToolResult(Arc::new(msg))
    }

    /// Convenience constructor for a plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage {
            content: UserContent::Text(text.into()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}

// ============================================================================
// Stop Reasons
// ============================================================================

/// Why a response ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    /// The model signaled a normal end of turn.
    Stop,
    /// The model hit a token limit.
    Length,
    /// The model requested tool execution.
    ToolUse,
    /// The request was aborted locally.
    Aborted,
}

// ============================================================================
// Content Blocks
// ============================================================================

/// A content block in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    /// Plain text content.
    Text(TextContent),
    /// Model thinking / reasoning output.
    Thinking(ThinkingContent),
    /// A request to call a tool with JSON arguments.
    ToolCall(ToolCall),
}

/// Text content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
}

impl TextContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Thinking/reasoning content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingContent {
    pub thinking: String,
}

/// Tool call content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

// ============================================================================
// Usage Tracking
// ============================================================================

/// Token usage tracking.
///
/// `input` already folds in cache-creation and cache-read tokens reported by
/// the underlying model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub total_tokens: u64,
}

// ============================================================================
// Session Metadata
// ============================================================================

/// Metadata key for the session identifier on batch responses.
pub const META_SESSION_ID: &str = "x-session-id";
/// Metadata key for the processed-message count on batch responses.
pub const META_MESSAGE_COUNT: &str = "x-message-count";
/// Metadata key for the JSON-encoded fingerprint array on batch responses.
pub const META_MESSAGE_FINGERPRINTS: &str = "x-message-fingerprints";
/// Metadata key present (value `"true"`) when a new session was forced.
pub const META_SESSION_FORCED_NEW: &str = "x-session-forced-new";

/// Session continuity data returned with every response.
///
/// The adapter holds no cross-call state; the caller must carry these values
/// into the next call's [`crate::provider::StreamOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub message_count: usize,
    pub message_fingerprints: Vec<String>,
    pub forced_new_session: bool,
}

impl SessionMeta {
    /// Render as the header-style key/value map used by batch responses.
    pub fn to_metadata(&self) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        map.insert(META_SESSION_ID.to_string(), self.session_id.clone());
        map.insert(
            META_MESSAGE_COUNT.to_string(),
            self.message_count.to_string(),
        );
        map.insert(
            META_MESSAGE_FINGERPRINTS.to_string(),
            serde_json::to_string(&self.message_fingerprints).unwrap_or_else(|_| "[]".to_string()),
        );
        if self.forced_new_session {
            map.insert(META_SESSION_FORCED_NEW.to_string(), "true".to_string());
        }
        map
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Streaming event emitted by the adapter.
///
/// Exactly one terminal [`StreamEvent::Done`] is emitted per successful call;
/// fatal failures surface as an `Err` item instead.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start {
        partial: AssistantMessage,
    },

    TextStart {
        content_index: usize,
    },
    TextDelta {
        content_index: usize,
        delta: String,
    },
    TextEnd {
        content_index: usize,
        content: String,
    },

    ThinkingStart {
        content_index: usize,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
    },
    ThinkingEnd {
        content_index: usize,
        content: String,
    },

    ToolCallStart {
        content_index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        content_index: usize,
        delta: String,
    },
    ToolCallEnd {
        content_index: usize,
        tool_call: ToolCall,
    },
    /// A tool envelope closed with arguments that never parsed as JSON.
    /// The span is closed without producing a tool call; parsing continues.
    ToolCallAbort {
        content_index: usize,
    },

    Done {
        reason: StopReason,
        message: AssistantMessage,
        session: Option<SessionMeta>,
    },
}
