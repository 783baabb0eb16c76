//! Wire grammar and incremental block parser for the text tool channel.
//!
//! The model speaks plain text; tool calls and prose are delimited by a
//! small pseudo-XML envelope grammar. One state machine handles both the
//! streaming case (arbitrary chunk boundaries, [`BlockParser::feed`] +
//! [`BlockParser::flush`]) and the complete-text case
//! ([`parse_blocks`] replays the same machine over the full input), so the
//! two modes cannot drift apart.
//!
//! Envelopes never nest: inside `<text>` only `</text>` is significant and
//! inside `<arguments>` only `</arguments>` is; envelope-looking substrings
//! there are literal content.

use crate::model::ToolCall;

// ============================================================================
// Wire Tags
// ============================================================================

pub const TEXT_OPEN: &str = "<text>";
pub const TEXT_CLOSE: &str = "</text>";
pub const TOOL_USE_OPEN: &str = "<tool_use>";
pub const TOOL_USE_CLOSE: &str = "</tool_use>";
pub const TOOL_NAME_OPEN: &str = "<tool_name>";
pub const TOOL_NAME_CLOSE: &str = "</tool_name>";
pub const TOOL_CALL_ID_OPEN: &str = "<tool_call_id>";
pub const TOOL_CALL_ID_CLOSE: &str = "</tool_call_id>";
pub const ARGUMENTS_OPEN: &str = "<arguments>";
pub const ARGUMENTS_CLOSE: &str = "</arguments>";

// Tool results travel in the opposite direction (host -> model); rendered by
// the history adapter, never parsed here.
pub const TOOL_RESULT_OPEN: &str = "<tool_result>";
pub const TOOL_RESULT_CLOSE: &str = "</tool_result>";
pub const OUTPUT_OPEN: &str = "<output>";
pub const OUTPUT_CLOSE: &str = "</output>";
pub const ERROR_OPEN: &str = "<error>";
pub const ERROR_CLOSE: &str = "</error>";

// ============================================================================
// Parser Output
// ============================================================================

/// Sub-event emitted while parsing the block grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockEvent {
    TextStart,
    TextDelta(String),
    TextEnd,
    /// Emitted as soon as both the tool name and call id sub-tags have
    /// closed; argument JSON may still be streaming.
    ToolInputStart { id: String, name: String },
    ToolInputDelta(String),
    ToolInputEnd,
    /// Follows `ToolInputEnd` once the accumulated argument text parsed as
    /// valid JSON.
    ToolCallComplete(ToolCall),
    /// Follows `ToolInputEnd` when the argument text never parsed; the block
    /// is dropped but parsing continues.
    ToolCallAborted,
}

/// A fully reconstructed block, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBlock {
    Text(String),
    ToolUse(ToolCall),
}

// ============================================================================
// Block Parser
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    InText,
    InToolUse,
    InToolName,
    InToolId,
    InToolArgs,
}

/// Incremental parser for the block grammar.
///
/// Chunk boundaries carry no significance: a tag split across feeds is held
/// back until it can be recognized or rejected. All state is scoped to one
/// response; allocate a fresh parser per call.
#[derive(Debug)]
pub struct BlockParser {
    state: State,
    buf: String,
    /// Raw input retained until the first span is recognized, for the
    /// non-compliant-model fallback (whole response as one text block).
    raw: String,
    produced: bool,
    pending_name: Option<String>,
    pending_id: Option<String>,
    pending_args: String,
    accum: String,
    start_emitted: bool,
}

impl Default for BlockParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockParser {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            buf: String::new(),
            raw: String::new(),
            produced: false,
            pending_name: None,
            pending_id: None,
            pending_args: String::new(),
            accum: String::new(),
            start_emitted: false,
        }
    }

    /// Feed a chunk and collect any events it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<BlockEvent> {
        self.buf.push_str(chunk);
        if !self.produced {
            self.raw.push_str(chunk);
        }
        let mut events = Vec::new();
        self.drain(&mut events);
        if self.produced {
            self.raw.clear();
        }
        events
    }

    /// Close any still-open span. Must be called exactly once at end of
    /// input; every emitted start is guaranteed a matching end.
    pub fn flush(&mut self) -> Vec<BlockEvent> {
        let mut events = Vec::new();
        match self.state {
            State::Outside => {
                if !self.produced && !self.raw.trim().is_empty() {
                    // The model ignored the envelope instructions entirely;
                    // surface the whole response as one text block.
                    let text = std::mem::take(&mut self.raw);
                    events.push(BlockEvent::TextStart);
                    events.push(BlockEvent::TextDelta(text));
                    events.push(BlockEvent::TextEnd);
                    self.produced = true;
                } else if !self.buf.trim().is_empty() {
                    tracing::debug!(len = self.buf.len(), "dropping untagged trailing text");
                }
            }
            State::InText => {
                let rest = std::mem::take(&mut self.buf);
                if !rest.is_empty() {
                    events.push(BlockEvent::TextDelta(rest));
                }
                events.push(BlockEvent::TextEnd);
            }
            State::InToolName | State::InToolId => {
                tracing::warn!("stream ended inside a tool envelope header; block dropped");
            }
            State::InToolUse | State::InToolArgs => {
                if self.state == State::InToolArgs {
                    let rest = std::mem::take(&mut self.buf);
                    if !rest.is_empty() {
                        if self.start_emitted {
                            events.push(BlockEvent::ToolInputDelta(rest.clone()));
                        }
                        self.pending_args.push_str(&rest);
                    }
                }
                if self.start_emitted {
                    events.push(BlockEvent::ToolInputEnd);
                    self.complete_tool(&mut events);
                } else {
                    tracing::warn!("stream ended inside an incomplete tool envelope; block dropped");
                }
            }
        }
        self.buf.clear();
        self.raw.clear();
        self.reset_tool();
        self.state = State::Outside;
        events
    }

    fn drain(&mut self, events: &mut Vec<BlockEvent>) {
        loop {
            match self.state {
                State::Outside => {
                    match find_earliest(&self.buf, &[TEXT_OPEN, TOOL_USE_OPEN]) {
                        Some((pos, tag)) => {
                            if !self.buf[..pos].trim().is_empty() {
                                tracing::debug!(
                                    len = pos,
                                    "dropping untagged text between envelopes"
                                );
                            }
                            self.buf.drain(..pos + tag.len());
                            if tag == TEXT_OPEN {
                                self.state = State::InText;
                                self.produced = true;
                                events.push(BlockEvent::TextStart);
                            } else {
                                self.state = State::InToolUse;
                                self.reset_tool();
                            }
                        }
                        None => {
                            let hold = holdback(&self.buf, &[TEXT_OPEN, TOOL_USE_OPEN]);
                            // Anything before a possible partial tag can never
                            // become one; discard it (it is still in `raw` for
                            // the fallback path).
                            if !self.buf[..hold].trim().is_empty() {
                                tracing::debug!(
                                    len = hold,
                                    "dropping untagged text between envelopes"
                                );
                            }
                            self.buf.drain(..hold);
                            break;
                        }
                    }
                }
                State::InText => match self.buf.find(TEXT_CLOSE) {
                    Some(pos) => {
                        if pos > 0 {
                            events.push(BlockEvent::TextDelta(self.buf[..pos].to_string()));
                        }
                        self.buf.drain(..pos + TEXT_CLOSE.len());
                        events.push(BlockEvent::TextEnd);
                        self.state = State::Outside;
                    }
                    None => {
                        let hold = holdback(&self.buf, &[TEXT_CLOSE]);
                        if hold > 0 {
                            let safe: String = self.buf.drain(..hold).collect();
                            events.push(BlockEvent::TextDelta(safe));
                        }
                        break;
                    }
                },
                State::InToolUse => {
                    let tags = [
                        TOOL_NAME_OPEN,
                        TOOL_CALL_ID_OPEN,
                        ARGUMENTS_OPEN,
                        TOOL_USE_CLOSE,
                    ];
                    match find_earliest(&self.buf, &tags) {
                        Some((pos, tag)) => {
                            // Content between sub-tags is formatting noise.
                            self.buf.drain(..pos + tag.len());
                            match tag {
                                TOOL_NAME_OPEN => self.state = State::InToolName,
                                TOOL_CALL_ID_OPEN => self.state = State::InToolId,
                                ARGUMENTS_OPEN => self.state = State::InToolArgs,
                                _ => {
                                    if self.start_emitted {
                                        events.push(BlockEvent::ToolInputEnd);
                                        self.complete_tool(events);
                                    } else {
                                        tracing::warn!(
                                            "tool envelope closed without a name and call id; \
                                             block dropped"
                                        );
                                        self.reset_tool();
                                    }
                                    self.state = State::Outside;
                                }
                            }
                        }
                        None => {
                            let hold = holdback(&self.buf, &tags);
                            self.buf.drain(..hold);
                            break;
                        }
                    }
                }
                State::InToolName => match self.buf.find(TOOL_NAME_CLOSE) {
                    Some(pos) => {
                        self.accum.push_str(&self.buf[..pos]);
                        self.buf.drain(..pos + TOOL_NAME_CLOSE.len());
                        self.pending_name = Some(std::mem::take(&mut self.accum));
                        self.state = State::InToolUse;
                        self.maybe_emit_start(events);
                    }
                    None => {
                        let hold = holdback(&self.buf, &[TOOL_NAME_CLOSE]);
                        let safe: String = self.buf.drain(..hold).collect();
                        self.accum.push_str(&safe);
                        break;
                    }
                },
                State::InToolId => match self.buf.find(TOOL_CALL_ID_CLOSE) {
                    Some(pos) => {
                        self.accum.push_str(&self.buf[..pos]);
                        self.buf.drain(..pos + TOOL_CALL_ID_CLOSE.len());
                        self.pending_id = Some(std::mem::take(&mut self.accum));
                        self.state = State::InToolUse;
                        self.maybe_emit_start(events);
                    }
                    None => {
                        let hold = holdback(&self.buf, &[TOOL_CALL_ID_CLOSE]);
                        let safe: String = self.buf.drain(..hold).collect();
                        self.accum.push_str(&safe);
                        break;
                    }
                },
                State::InToolArgs => match self.buf.find(ARGUMENTS_CLOSE) {
                    Some(pos) => {
                        if pos > 0 {
                            let piece = self.buf[..pos].to_string();
                            if self.start_emitted {
                                events.push(BlockEvent::ToolInputDelta(piece.clone()));
                            }
                            self.pending_args.push_str(&piece);
                        }
                        self.buf.drain(..pos + ARGUMENTS_CLOSE.len());
                        self.state = State::InToolUse;
                    }
                    None => {
                        let hold = holdback(&self.buf, &[ARGUMENTS_CLOSE]);
                        if hold > 0 {
                            let safe: String = self.buf.drain(..hold).collect();
                            if self.start_emitted {
                                events.push(BlockEvent::ToolInputDelta(safe.clone()));
                            }
                            self.pending_args.push_str(&safe);
                        }
                        break;
                    }
                },
            }
        }
    }

    fn maybe_emit_start(&mut self, events: &mut Vec<BlockEvent>) {
        if self.start_emitted {
            return;
        }
        let (Some(id), Some(name)) = (self.pending_id.clone(), self.pending_name.clone()) else {
            return;
        };
        self.start_emitted = true;
        self.produced = true;
        events.push(BlockEvent::ToolInputStart { id, name });
        // Arguments that streamed before the header finished are caught up in
        // one delta so delta concatenation always equals the full argument
        // text.
        if !self.pending_args.is_empty() {
            events.push(BlockEvent::ToolInputDelta(self.pending_args.clone()));
        }
    }

    fn complete_tool(&mut self, events: &mut Vec<BlockEvent>) {
        let id = self.pending_id.take().unwrap_or_default();
        let name = self.pending_name.take().unwrap_or_default();
        let args_text = std::mem::take(&mut self.pending_args);
        let trimmed = args_text.trim();

        let arguments = if trimmed.is_empty() {
            Ok(serde_json::Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_str::<serde_json::Value>(trimmed)
        };

        match arguments {
            Ok(arguments) => {
                events.push(BlockEvent::ToolCallComplete(ToolCall {
                    id,
                    name,
                    arguments,
                }));
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    tool = %name,
                    raw = %args_text,
                    "failed to parse tool arguments as JSON; block dropped"
                );
                events.push(BlockEvent::ToolCallAborted);
            }
        }
        self.reset_tool();
    }

    fn reset_tool(&mut self) {
        self.pending_name = None;
        self.pending_id = None;
        self.pending_args.clear();
        self.accum.clear();
        self.start_emitted = false;
    }
}

// ============================================================================
// Complete-Text Parsing
// ============================================================================

/// Parse a complete response into ordered blocks.
///
/// Replays the incremental machine over the full input, so streaming and
/// batch parsing share one grammar definition.
pub fn parse_blocks(text: &str) -> Vec<ParsedBlock> {
    let mut parser = BlockParser::new();
    let mut events = parser.feed(text);
    events.extend(parser.flush());
    replay_events(&events)
}

/// Fold a block event sequence back into ordered blocks.
pub fn replay_events(events: &[BlockEvent]) -> Vec<ParsedBlock> {
    let mut blocks = Vec::new();
    let mut current_text: Option<String> = None;

    for event in events {
        match event {
            BlockEvent::TextStart => current_text = Some(String::new()),
            BlockEvent::TextDelta(delta) => {
                if let Some(text) = current_text.as_mut() {
                    text.push_str(delta);
                }
            }
            BlockEvent::TextEnd => {
                if let Some(text) = current_text.take() {
                    blocks.push(ParsedBlock::Text(text));
                }
            }
            BlockEvent::ToolCallComplete(tool_call) => {
                blocks.push(ParsedBlock::ToolUse(tool_call.clone()));
            }
            BlockEvent::ToolInputStart { .. }
            | BlockEvent::ToolInputDelta(_)
            | BlockEvent::ToolInputEnd
            | BlockEvent::ToolCallAborted => {}
        }
    }
    blocks
}

// ============================================================================
// Tag Scanning Helpers
// ============================================================================

/// Earliest occurrence of any of `tags` in `haystack`.
fn find_earliest<'t>(haystack: &str, tags: &[&'t str]) -> Option<(usize, &'t str)> {
    let mut best: Option<(usize, &'t str)> = None;
    for &tag in tags {
        if let Some(pos) = haystack.find(tag) {
            if best.map_or(true, |(b, _)| pos < b) {
                best = Some((pos, tag));
            }
        }
    }
    best
}

/// Byte index from which `buf` must be held back because its suffix could
/// still grow into one of `tags`. Tags are ASCII, so every candidate split
/// point (a `<` byte) is a char boundary.
fn holdback(buf: &str, tags: &[&str]) -> usize {
    let max_len = tags.iter().map(|t| t.len()).max().unwrap_or(0);
    let window_start = buf.len().saturating_sub(max_len.saturating_sub(1));
    let bytes = buf.as_bytes();
    for pos in window_start..buf.len() {
        if bytes[pos] != b'<' {
            continue;
        }
        let suffix = &buf[pos..];
        if tags.iter().any(|tag| tag.starts_with(suffix)) {
            return pos;
        }
    }
    buf.len()
}

// ============================================================================
// Tests
// ============================================================================
