//! Message-history adaptation for the text channel.
//!
//! The underlying model keeps its own server-side conversation keyed by a
//! session id, so the adapter must decide per call which history messages to
//! re-serialize as text. Fingerprints of already-processed messages detect
//! rewound or edited history; on any inconsistency the resume intent is
//! abandoned and the full history is replayed into a fresh session.

use crate::blocks::{
    ERROR_CLOSE, ERROR_OPEN, OUTPUT_CLOSE, OUTPUT_OPEN, TOOL_CALL_ID_CLOSE, TOOL_CALL_ID_OPEN,
    TOOL_RESULT_CLOSE, TOOL_RESULT_OPEN,
};
use crate::model::{ContentBlock, Message, UserContent};
use crate::provider::StreamOptions;

/// Marker prefixed to replayed assistant turns. The text channel has no
/// structural role separation, so prior model output must be labeled.
pub const ASSISTANT_MARKER: &str = "[Previous assistant reply]";

/// Fingerprints cover the first this-many characters of a message's text.
const FINGERPRINT_WINDOW: usize = 100;

// ============================================================================
// Fingerprints
// ============================================================================

/// Compute the fingerprint of a message: `role:first100CharsOfJoinedText`.
///
/// Deterministic and order-insensitive to anything beyond the role and the
/// leading text window; collisions past that window are an accepted
/// trade-off.
pub fn fingerprint(message: &Message) -> String {
    let (role, text) = match message {
        Message::User(user) => ("user", joined_user_text(&user.content)),
        Message::Assistant(assistant) => ("assistant", joined_text(&assistant.content)),
        Message::ToolResult(result) => ("tool", joined_text(&result.content)),
    };
    let head: String = text.chars().take(FINGERPRINT_WINDOW).collect();
    format!("{role}:{head}")
}

/// Fingerprints for an entire history, in order.
pub fn fingerprints(messages: &[Message]) -> Vec<String> {
    messages.iter().map(fingerprint).collect()
}

fn joined_user_text(content: &UserContent) -> String {
    match content {
        UserContent::Text(text) => text.clone(),
        UserContent::Blocks(blocks) => joined_text(blocks),
    }
}

fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(t) => Some(t.text.as_str()),
            ContentBlock::Thinking(_) | ContentBlock::ToolCall(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// History Prompt
// ============================================================================

/// Result of adapting the history for one call.
#[derive(Debug, Clone)]
pub struct HistoryPrompt {
    /// The serialized prompt body to send over the text channel.
    pub prompt_text: String,
    /// True when resume was requested but the history no longer matches what
    /// the session already processed.
    pub forced_new_session: bool,
    /// Fingerprints of the entire current history, for the caller to persist.
    pub fingerprints: Vec<String>,
}

/// Decide which messages to re-serialize and whether to abandon the resume.
pub fn build_history_prompt(messages: &[Message], options: &StreamOptions) -> HistoryPrompt {
    let all_fingerprints = fingerprints(messages);

    let (tail_start, forced_new_session) = match (
        options.session_id.as_deref(),
        options.last_processed_message_count,
        options.message_fingerprints.as_deref(),
    ) {
        // No session to resume: replay everything.
        (None, _, _) => (0, false),
        // Precise tracking supplied: verify the already-processed prefix.
        (Some(session_id), Some(count), Some(prior)) => {
            if prefix_is_consistent(&all_fingerprints, count, prior) {
                (count, false)
            } else {
                tracing::warn!(
                    session_id,
                    expected = count,
                    actual = messages.len(),
                    "history was rewound or edited; forcing a new session"
                );
                (0, true)
            }
        }
        // Caller opted out of tracking: conservatively replay only the most
        // recent user turn (plus trailing tool results) rather than risking
        // duplicated context.
        (Some(_), _, _) => (last_user_index(messages), false),
    };

    let prompt_text = serialize_messages(&messages[tail_start.min(messages.len())..]);

    HistoryPrompt {
        prompt_text,
        forced_new_session,
        fingerprints: all_fingerprints,
    }
}

fn prefix_is_consistent(current: &[String], count: usize, prior: &[String]) -> bool {
    if current.len() < count {
        return false;
    }
    let window = count.min(prior.len()).min(current.len());
    current[..window] == prior[..window]
}

fn last_user_index(messages: &[Message]) -> usize {
    messages
        .iter()
        .rposition(|m| matches!(m, Message::User(_)))
        .unwrap_or(0)
}

// ============================================================================
// Serialization
// ============================================================================

fn serialize_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(serialize_message)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn serialize_message(message: &Message) -> String {
    match message {
        Message::User(user) => joined_user_text(&user.content),
        Message::Assistant(assistant) => {
            let text = joined_text(&assistant.content);
            if text.is_empty() {
                String::new()
            } else {
                format!("{ASSISTANT_MARKER}\n{text}")
            }
        }
        Message::ToolResult(result) => {
            let payload = joined_text(&result.content);
            let (open, close) = if result.is_error {
                (ERROR_OPEN, ERROR_CLOSE)
            } else {
                (OUTPUT_OPEN, OUTPUT_CLOSE)
            };
            format!(
                "{TOOL_RESULT_OPEN}\n{TOOL_CALL_ID_OPEN}{}{TOOL_CALL_ID_CLOSE}\n{open}\n{payload}\n{close}\n{TOOL_RESULT_CLOSE}",
                result.tool_call_id
            )
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
