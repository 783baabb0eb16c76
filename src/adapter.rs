//! Response assembly: driving the text model and interpreting its output.
//!
//! [`TextToolAdapter`] implements [`Provider`] on top of any [`TextModel`].
//! Per call it renders the tool protocol into the system prompt, serializes
//! the history tail, drives one model invocation, and routes visible text
//! through the block parser so tool envelopes become structured
//! [`StreamEvent`]s. All state is scoped to the call; session continuity
//! travels in [`SessionMeta`] and comes back in the next call's options.

use crate::blocks::{BlockEvent, BlockParser};
use crate::error::{Error, Result};
use crate::history::build_history_prompt;
use crate::model::{
    AssistantMessage, ContentBlock, SessionMeta, StopReason, StreamEvent, TextContent,
    ThinkingContent, ToolCall, Usage,
};
use crate::provider::{Completion, Context, EventStream, Provider, StreamOptions};
use crate::schema::render_tool_protocol;
use crate::text_model::{
    FailureKind, TextEventStream, TextModel, TextModelEvent, TextRequest, TextStop,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// API identifier reported by the adapter.
pub const API_NAME: &str = "text-tools";

// ============================================================================
// Adapter
// ============================================================================

/// Tool-calling provider backed by a plain-text model channel.
pub struct TextToolAdapter<M> {
    model: M,
    provider_name: String,
}

impl<M: TextModel> TextToolAdapter<M> {
    /// Create a new adapter around the given model.
    pub fn new(model: M) -> Self {
        Self {
            model,
            provider_name: "cli".to_string(),
        }
    }

    /// Override the provider name reported in results.
    #[must_use]
    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    fn compose_system_prompt(context: &Context) -> Option<String> {
        let tool_section =
            (!context.tools.is_empty()).then(|| render_tool_protocol(&context.tools));
        match (context.system_prompt.clone(), tool_section) {
            (Some(system), Some(tools)) => Some(format!("{system}\n\n{tools}")),
            (Some(system), None) => Some(system),
            (None, Some(tools)) => Some(tools),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl<M: TextModel> Provider for TextToolAdapter<M> {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn api(&self) -> &str {
        API_NAME
    }

    fn model_id(&self) -> &str {
        self.model.model_id()
    }

    async fn stream(&self, context: &Context, options: &StreamOptions) -> Result<EventStream> {
        let history = build_history_prompt(&context.messages, options);
        let resume_session_id = if history.forced_new_session {
            None
        } else {
            options.session_id.clone()
        };

        let request = TextRequest {
            system_prompt: Self::compose_system_prompt(context),
            prompt: history.prompt_text,
            resume_session_id,
            max_thinking_tokens: options.max_thinking_tokens,
        };

        let upstream = self
            .model
            .stream(request)
            .await
            .map_err(|e| Error::invocation(self.model.model_id(), e.to_string()))?;

        let mut state = CallState {
            upstream,
            model_id: self.model.model_id().to_string(),
            partial: AssistantMessage {
                api: API_NAME.to_string(),
                provider: self.provider_name.clone(),
                model: self.model.model_id().to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
            parser: (!context.tools.is_empty()).then(BlockParser::new),
            pending: VecDeque::new(),
            thinking_index: None,
            text_index: None,
            tool_index: None,
            session_id: options.session_id.clone().filter(|_| !history.forced_new_session),
            message_count: context.messages.len(),
            fingerprints: history.fingerprints,
            forced_new_session: history.forced_new_session,
            saw_tool_call: false,
            cancel: options.cancel.clone(),
            finished: false,
        };
        state.pending.push_back(Ok(StreamEvent::Start {
            partial: state.partial.clone(),
        }));

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                if state.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    state.handle_cancel();
                    continue;
                }

                let pulled = match state.cancel.clone() {
                    Some(token) => match token.run_until_cancelled(state.upstream.next()).await {
                        Some(item) => item,
                        None => {
                            state.handle_cancel();
                            continue;
                        }
                    },
                    None => state.upstream.next().await,
                };

                match pulled {
                    Some(Ok(event)) => state.handle_event(event),
                    Some(Err(e)) => {
                        state.finished = true;
                        let err = match e {
                            e @ (Error::TurnLimit { .. } | Error::Execution { .. }) => e,
                            other => Error::invocation(state.model_id.clone(), other.to_string()),
                        };
                        return Some((Err(err), state));
                    }
                    // Upstream ended without a terminal event (e.g. process
                    // exit); close spans and surface the partial message.
                    None => state.handle_upstream_end(),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn generate(&self, context: &Context, options: &StreamOptions) -> Result<Completion> {
        let mut stream = self.stream(context, options).await?;
        let mut done: Option<(AssistantMessage, Option<SessionMeta>)> = None;

        while let Some(item) = stream.next().await {
            if let StreamEvent::Done {
                message, session, ..
            } = item?
            {
                done = Some((message, session));
            }
        }

        let (message, session) = done
            .ok_or_else(|| Error::api("model stream ended without a terminal event"))?;
        Ok(Completion {
            message,
            metadata: session.map(|s| s.to_metadata()).unwrap_or_default(),
        })
    }
}

// ============================================================================
// Per-Call State
// ============================================================================

struct CallState {
    upstream: TextEventStream,
    model_id: String,
    partial: AssistantMessage,
    /// Present only when tools were supplied; without tools visible text
    /// passes through verbatim with no tag interpretation.
    parser: Option<BlockParser>,
    pending: VecDeque<Result<StreamEvent>>,
    thinking_index: Option<usize>,
    text_index: Option<usize>,
    tool_index: Option<usize>,
    session_id: Option<String>,
    message_count: usize,
    fingerprints: Vec<String>,
    forced_new_session: bool,
    saw_tool_call: bool,
    cancel: Option<CancellationToken>,
    finished: bool,
}

impl CallState {
    fn handle_event(&mut self, event: TextModelEvent) {
        match event {
            TextModelEvent::SessionStart { session_id } => {
                self.session_id = Some(session_id);
            }
            TextModelEvent::ThinkingDelta { delta } => self.on_thinking_delta(delta),
            TextModelEvent::TextDelta { delta } => self.on_text_delta(&delta),
            TextModelEvent::Completed { stop, usage } => self.on_completed(stop, usage),
            TextModelEvent::Failed { kind, message } => {
                self.finished = true;
                let err = match kind {
                    FailureKind::TurnLimit => Error::turn_limit(self.model_id.clone()),
                    FailureKind::Execution => Error::execution(self.model_id.clone(), message),
                };
                self.pending.push_back(Err(err));
            }
        }
    }

    fn on_thinking_delta(&mut self, delta: String) {
        let index = match self.thinking_index {
            Some(index) => index,
            None => {
                let index = self.partial.content.len();
                self.partial
                    .content
                    .push(ContentBlock::Thinking(ThinkingContent {
                        thinking: String::new(),
                    }));
                self.thinking_index = Some(index);
                self.pending.push_back(Ok(StreamEvent::ThinkingStart {
                    content_index: index,
                }));
                index
            }
        };
        if let Some(ContentBlock::Thinking(t)) = self.partial.content.get_mut(index) {
            t.thinking.push_str(&delta);
        }
        self.pending.push_back(Ok(StreamEvent::ThinkingDelta {
            content_index: index,
            delta,
        }));
    }

    fn on_text_delta(&mut self, delta: &str) {
        self.close_thinking();
        match self.parser.as_mut() {
            Some(parser) => {
                let events = parser.feed(delta);
                for event in events {
                    self.apply_block_event(event);
                }
            }
            None => self.passthrough_text(delta),
        }
    }

    fn passthrough_text(&mut self, delta: &str) {
        let index = match self.text_index {
            Some(index) => index,
            None => {
                let index = self.partial.content.len();
                self.partial
                    .content
                    .push(ContentBlock::Text(TextContent::new("")));
                self.text_index = Some(index);
                self.pending.push_back(Ok(StreamEvent::TextStart {
                    content_index: index,
                }));
                index
            }
        };
        if let Some(ContentBlock::Text(t)) = self.partial.content.get_mut(index) {
            t.text.push_str(delta);
        }
        self.pending.push_back(Ok(StreamEvent::TextDelta {
            content_index: index,
            delta: delta.to_string(),
        }));
    }

    fn apply_block_event(&mut self, event: BlockEvent) {
        match event {
            BlockEvent::TextStart => {
                let index = self.partial.content.len();
                self.partial
                    .content
                    .push(ContentBlock::Text(TextContent::new("")));
                self.text_index = Some(index);
                self.pending.push_back(Ok(StreamEvent::TextStart {
                    content_index: index,
                }));
            }
            BlockEvent::TextDelta(delta) => {
                let Some(index) = self.text_index else {
                    return;
                };
                if let Some(ContentBlock::Text(t)) = self.partial.content.get_mut(index) {
                    t.text.push_str(&delta);
                }
                self.pending.push_back(Ok(StreamEvent::TextDelta {
                    content_index: index,
                    delta,
                }));
            }
            BlockEvent::TextEnd => {
                let Some(index) = self.text_index.take() else {
                    return;
                };
                let content = match self.partial.content.get(index) {
                    Some(ContentBlock::Text(t)) => t.text.clone(),
                    _ => String::new(),
                };
                self.pending.push_back(Ok(StreamEvent::TextEnd {
                    content_index: index,
                    content,
                }));
            }
            BlockEvent::ToolInputStart { id, name } => {
                let index = self.partial.content.len();
                self.partial.content.push(ContentBlock::ToolCall(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: serde_json::Value::Null,
                }));
                self.tool_index = Some(index);
                self.pending.push_back(Ok(StreamEvent::ToolCallStart {
                    content_index: index,
                    id,
                    name,
                }));
            }
            BlockEvent::ToolInputDelta(delta) => {
                let Some(index) = self.tool_index else {
                    return;
                };
                self.pending.push_back(Ok(StreamEvent::ToolCallDelta {
                    content_index: index,
                    delta,
                }));
            }
            BlockEvent::ToolInputEnd => {}
            BlockEvent::ToolCallComplete(tool_call) => {
                let Some(index) = self.tool_index.take() else {
                    return;
                };
                if let Some(ContentBlock::ToolCall(tc)) = self.partial.content.get_mut(index) {
                    *tc = tool_call.clone();
                }
                self.saw_tool_call = true;
                self.pending.push_back(Ok(StreamEvent::ToolCallEnd {
                    content_index: index,
                    tool_call,
                }));
            }
            BlockEvent::ToolCallAborted => {
                let Some(index) = self.tool_index.take() else {
                    return;
                };
                if index < self.partial.content.len() {
                    self.partial.content.remove(index);
                }
                self.pending.push_back(Ok(StreamEvent::ToolCallAbort {
                    content_index: index,
                }));
            }
        }
    }

    fn close_thinking(&mut self) {
        if let Some(index) = self.thinking_index.take() {
            let content = match self.partial.content.get(index) {
                Some(ContentBlock::Thinking(t)) => t.thinking.clone(),
                _ => String::new(),
            };
            self.pending.push_back(Ok(StreamEvent::ThinkingEnd {
                content_index: index,
                content,
            }));
        }
    }

    fn on_completed(&mut self, stop: TextStop, usage: crate::text_model::TextUsage) {
        self.close_thinking();
        if let Some(mut parser) = self.parser.take() {
            let events = parser.flush();
            for event in events {
                self.apply_block_event(event);
            }
        } else if self.text_index.is_some() {
            self.apply_block_event(BlockEvent::TextEnd);
        }

        let input =
            usage.input_tokens + usage.cache_creation_input_tokens + usage.cache_read_input_tokens;
        self.partial.usage = Usage {
            input,
            output: usage.output_tokens,
            total_tokens: input + usage.output_tokens,
        };

        let reason = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            match stop {
                TextStop::EndTurn => StopReason::Stop,
                TextStop::MaxTokens => StopReason::Length,
            }
        };
        self.finish(reason);
    }

    fn handle_upstream_end(&mut self) {
        self.close_thinking();
        if let Some(mut parser) = self.parser.take() {
            let events = parser.flush();
            for event in events {
                self.apply_block_event(event);
            }
        } else if self.text_index.is_some() {
            self.apply_block_event(BlockEvent::TextEnd);
        }
        let reason = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            self.partial.stop_reason
        };
        self.finish(reason);
    }

    fn handle_cancel(&mut self) {
        self.close_thinking();
        // Close open spans without flushing the parser: a cancelled call must
        // not emit completion events for half-received tool input.
        self.parser = None;
        if self.text_index.is_some() {
            self.apply_block_event(BlockEvent::TextEnd);
        }
        if self.tool_index.is_some() {
            self.apply_block_event(BlockEvent::ToolCallAborted);
        }
        self.finish(StopReason::Aborted);
    }

    fn finish(&mut self, reason: StopReason) {
        self.partial.stop_reason = reason;
        let session = self.session_id.clone().map(|session_id| SessionMeta {
            session_id,
            // The session has now also seen the reply it just produced.
            message_count: self.message_count + 1,
            message_fingerprints: self.fingerprints.clone(),
            forced_new_session: self.forced_new_session,
        });
        self.pending.push_back(Ok(StreamEvent::Done {
            reason,
            message: self.partial.clone(),
            session,
        }));
        self.finished = true;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::fingerprints;
    use crate::model::{
        Message, META_MESSAGE_COUNT, META_SESSION_FORCED_NEW, META_SESSION_ID,
    };
    use crate::provider::ToolDef;
    use crate::text_model::TextUsage;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct ScriptedModel {
        events: Vec<TextModelEvent>,
        hang_after_events: bool,
        captured: Arc<Mutex<Vec<TextRequest>>>,
    }

    impl ScriptedModel {
        fn new(events: Vec<TextModelEvent>) -> Self {
            Self {
                events,
                hang_after_events: false,
                captured: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn hanging(mut self) -> Self {
            self.hang_after_events = true;
            self
        }

        fn requests(&self) -> Arc<Mutex<Vec<TextRequest>>> {
            Arc::clone(&self.captured)
        }
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "cli-test"
        }

        async fn stream(&self, request: TextRequest) -> Result<TextEventStream> {
            self.captured.lock().expect("lock").push(request);
            let scripted = stream::iter(self.events.clone().into_iter().map(Ok));
            if self.hang_after_events {
                Ok(Box::pin(scripted.chain(stream::pending())))
            } else {
                Ok(Box::pin(scripted))
            }
        }
    }

    fn read_tool() -> ToolDef {
        ToolDef {
            name: "Read".to_string(),
            description: "Read a file.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "file_path": { "type": "string" } },
                "required": ["file_path"]
            }),
        }
    }

    fn usage() -> TextUsage {
        TextUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: 2,
            cache_read_input_tokens: 3,
        }
    }

    fn completed() -> TextModelEvent {
        TextModelEvent::Completed {
            stop: TextStop::EndTurn,
            usage: usage(),
        }
    }

    async fn collect(
        adapter: &TextToolAdapter<ScriptedModel>,
        context: &Context,
        options: &StreamOptions,
    ) -> Vec<StreamEvent> {
        let mut stream = adapter.stream(context, options).await.expect("stream");
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.expect("stream event"));
        }
        out
    }

    #[tokio::test]
    async fn test_text_and_tool_call_scenario() {
        let wire = "<text>Checking file</text><tool_use><tool_name>Read</tool_name>\
                    <tool_call_id>call_1</tool_call_id>\
                    <arguments>{\"file_path\":\"/a.ts\"}</arguments></tool_use>";
        // Split at an awkward boundary inside a closing tag.
        let (a, b) = wire.split_at(27);
        let model = ScriptedModel::new(vec![
            TextModelEvent::SessionStart {
                session_id: "sess_a".to_string(),
            },
            TextModelEvent::TextDelta {
                delta: a.to_string(),
            },
            TextModelEvent::TextDelta {
                delta: b.to_string(),
            },
            completed(),
        ]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            system_prompt: None,
            messages: vec![Message::user("check /a.ts")],
            tools: vec![read_tool()],
        };

        let events = collect(&adapter, &context, &StreamOptions::default()).await;

        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextEnd { content, .. } if content == "Checking file")));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolCallStart { id, name, .. } if id == "call_1" && name == "Read"
        )));

        let StreamEvent::Done {
            reason,
            message,
            session,
        } = events.last().expect("terminal event")
        else {
            panic!("expected Done, got {:?}", events.last());
        };
        assert_eq!(*reason, StopReason::ToolUse);
        assert_eq!(message.usage.input, 15);
        assert_eq!(message.usage.output, 5);
        assert_eq!(message.usage.total_tokens, 20);
        assert_eq!(message.content.len(), 2);
        assert!(matches!(
            &message.content[1],
            ContentBlock::ToolCall(tc) if tc.arguments == json!({"file_path": "/a.ts"})
        ));

        let session = session.as_ref().expect("session metadata");
        assert_eq!(session.session_id, "sess_a");
        assert_eq!(session.message_count, 2);
        assert_eq!(session.message_fingerprints.len(), 1);
        assert!(!session.forced_new_session);
    }

    #[tokio::test]
    async fn test_no_tools_passthrough_leaves_envelopes_verbatim() {
        let raw = "literal <text>not parsed</text> and <tool_use> too";
        let model = ScriptedModel::new(vec![
            TextModelEvent::TextDelta {
                delta: raw.to_string(),
            },
            completed(),
        ]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };

        let events = collect(&adapter, &context, &StreamOptions::default()).await;
        let StreamEvent::Done { reason, message, .. } = events.last().expect("done") else {
            panic!("expected Done");
        };
        assert_eq!(*reason, StopReason::Stop);
        assert_eq!(
            message.content,
            vec![ContentBlock::Text(TextContent::new(raw))]
        );
    }

    #[tokio::test]
    async fn test_thinking_precedes_text_blocks() {
        let model = ScriptedModel::new(vec![
            TextModelEvent::ThinkingDelta {
                delta: "step ".to_string(),
            },
            TextModelEvent::ThinkingDelta {
                delta: "one".to_string(),
            },
            TextModelEvent::TextDelta {
                delta: "<text>hi</text>".to_string(),
            },
            completed(),
        ]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("hi")],
            tools: vec![read_tool()],
            ..Default::default()
        };

        let events = collect(&adapter, &context, &StreamOptions::default()).await;
        let thinking_end = events
            .iter()
            .position(|e| matches!(e, StreamEvent::ThinkingEnd { content, .. } if content == "step one"))
            .expect("thinking end");
        let text_start = events
            .iter()
            .position(|e| matches!(e, StreamEvent::TextStart { .. }))
            .expect("text start");
        assert!(thinking_end < text_start);

        let StreamEvent::Done { message, .. } = events.last().expect("done") else {
            panic!("expected Done");
        };
        assert!(matches!(&message.content[0], ContentBlock::Thinking(t) if t.thinking == "step one"));
        assert!(matches!(&message.content[1], ContentBlock::Text(t) if t.text == "hi"));
    }

    #[tokio::test]
    async fn test_turn_limit_failure_surfaces_as_error() {
        let model = ScriptedModel::new(vec![TextModelEvent::Failed {
            kind: FailureKind::TurnLimit,
            message: "too many turns".to_string(),
        }]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };

        let mut stream = adapter
            .stream(&context, &StreamOptions::default())
            .await
            .expect("stream");
        // Start event first, then the error terminates the stream.
        let first = stream.next().await.expect("start").expect("ok");
        assert!(matches!(first, StreamEvent::Start { .. }));
        let err = stream.next().await.expect("item").expect_err("error item");
        assert!(matches!(err, Error::TurnLimit { model } if model == "cli-test"));
    }

    #[tokio::test]
    async fn test_execution_failure_rejects_generate() {
        let model = ScriptedModel::new(vec![TextModelEvent::Failed {
            kind: FailureKind::Execution,
            message: "internal crash".to_string(),
        }]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };

        let err = adapter
            .generate(&context, &StreamOptions::default())
            .await
            .expect_err("generate should fail");
        assert!(matches!(err, Error::Execution { .. }));
        assert!(err.to_string().contains("internal crash"));
    }

    #[tokio::test]
    async fn test_generate_returns_header_style_metadata() {
        let model = ScriptedModel::new(vec![
            TextModelEvent::SessionStart {
                session_id: "sess_b".to_string(),
            },
            TextModelEvent::TextDelta {
                delta: "hello".to_string(),
            },
            completed(),
        ]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };

        let completion = adapter
            .generate(&context, &StreamOptions::default())
            .await
            .expect("completion");
        assert_eq!(
            completion.metadata.get(META_SESSION_ID).map(String::as_str),
            Some("sess_b")
        );
        assert_eq!(
            completion
                .metadata
                .get(META_MESSAGE_COUNT)
                .map(String::as_str),
            Some("2")
        );
        assert!(!completion.metadata.contains_key(META_SESSION_FORCED_NEW));
        assert_eq!(completion.message.content.len(), 1);
    }

    #[tokio::test]
    async fn test_forced_new_session_drops_resume_and_flags_metadata() {
        let model = ScriptedModel::new(vec![
            TextModelEvent::SessionStart {
                session_id: "sess_new".to_string(),
            },
            TextModelEvent::TextDelta {
                delta: "ok".to_string(),
            },
            completed(),
        ]);
        let requests = model.requests();
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("edited message")],
            ..Default::default()
        };
        let options = StreamOptions {
            session_id: Some("sess_old".to_string()),
            last_processed_message_count: Some(1),
            message_fingerprints: Some(vec!["user:original message".to_string()]),
            ..Default::default()
        };

        let completion = adapter.generate(&context, &options).await.expect("completion");
        assert_eq!(
            completion
                .metadata
                .get(META_SESSION_FORCED_NEW)
                .map(String::as_str),
            Some("true")
        );
        assert_eq!(
            completion.metadata.get(META_SESSION_ID).map(String::as_str),
            Some("sess_new")
        );

        let captured = requests.lock().expect("lock");
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].resume_session_id, None);
        assert!(captured[0].prompt.contains("edited message"));
    }

    #[tokio::test]
    async fn test_consistent_resume_sends_only_the_tail() {
        let model = ScriptedModel::new(vec![
            TextModelEvent::TextDelta {
                delta: "ok".to_string(),
            },
            completed(),
        ]);
        let requests = model.requests();
        let adapter = TextToolAdapter::new(model);
        let history = vec![Message::user("first"), Message::user("second")];
        let prior = fingerprints(&history[..1]);
        let context = Context {
            messages: history,
            ..Default::default()
        };
        let options = StreamOptions {
            session_id: Some("sess_1".to_string()),
            last_processed_message_count: Some(1),
            message_fingerprints: Some(prior),
            max_thinking_tokens: Some(4096),
            ..Default::default()
        };

        let completion = adapter.generate(&context, &options).await.expect("completion");
        // No upstream SessionStart: the resumed id is carried through.
        assert_eq!(
            completion.metadata.get(META_SESSION_ID).map(String::as_str),
            Some("sess_1")
        );

        let captured = requests.lock().expect("lock");
        assert_eq!(captured[0].resume_session_id.as_deref(), Some("sess_1"));
        assert_eq!(captured[0].prompt, "second");
        assert_eq!(captured[0].max_thinking_tokens, Some(4096));
    }

    #[tokio::test]
    async fn test_malformed_tool_arguments_drop_block_and_continue() {
        let wire = "<tool_use><tool_name>Read</tool_name><tool_call_id>c1</tool_call_id>\
                    <arguments>{broken</arguments></tool_use><text>recovered</text>";
        let model = ScriptedModel::new(vec![
            TextModelEvent::TextDelta {
                delta: wire.to_string(),
            },
            completed(),
        ]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("go")],
            tools: vec![read_tool()],
            ..Default::default()
        };

        let events = collect(&adapter, &context, &StreamOptions::default()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallAbort { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallEnd { .. })));

        let StreamEvent::Done { reason, message, .. } = events.last().expect("done") else {
            panic!("expected Done");
        };
        assert_eq!(*reason, StopReason::Stop);
        assert_eq!(
            message.content,
            vec![ContentBlock::Text(TextContent::new("recovered"))]
        );
    }

    #[tokio::test]
    async fn test_cancellation_closes_open_text_span() {
        let model = ScriptedModel::new(vec![TextModelEvent::TextDelta {
            delta: "<text>par".to_string(),
        }])
        .hanging();
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("go")],
            tools: vec![read_tool()],
            ..Default::default()
        };
        let token = CancellationToken::new();
        let options = StreamOptions {
            cancel: Some(token.clone()),
            ..Default::default()
        };

        let mut stream = adapter.stream(&context, &options).await.expect("stream");
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(stream.next().await.expect("event").expect("ok"));
        }
        assert!(matches!(events[1], StreamEvent::TextStart { .. }));
        token.cancel();

        while let Some(item) = stream.next().await {
            events.push(item.expect("ok"));
        }
        let ends = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TextEnd { .. }))
            .count();
        assert_eq!(ends, 1, "open span closed exactly once: {events:?}");
        let StreamEvent::Done { reason, .. } = events.last().expect("done") else {
            panic!("expected Done, got {:?}", events.last());
        };
        assert_eq!(*reason, StopReason::Aborted);
    }

    #[tokio::test]
    async fn test_upstream_end_without_terminal_still_finishes() {
        let model = ScriptedModel::new(vec![TextModelEvent::TextDelta {
            delta: "<text>cut off".to_string(),
        }]);
        let adapter = TextToolAdapter::new(model);
        let context = Context {
            messages: vec![Message::user("go")],
            tools: vec![read_tool()],
            ..Default::default()
        };

        let events = collect(&adapter, &context, &StreamOptions::default()).await;
        let done_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Done { .. }))
            .count();
        assert_eq!(done_count, 1);
        let StreamEvent::Done { message, .. } = events.last().expect("done") else {
            panic!("expected Done");
        };
        assert_eq!(
            message.content,
            vec![ContentBlock::Text(TextContent::new("cut off"))]
        );
    }

    #[tokio::test]
    async fn test_system_prompt_carries_tool_protocol_only_with_tools() {
        let model = ScriptedModel::new(vec![completed()]);
        let requests = model.requests();
        let adapter = TextToolAdapter::new(model);
        let options = StreamOptions::default();

        let with_tools = Context {
            system_prompt: Some("Be helpful.".to_string()),
            messages: vec![Message::user("hi")],
            tools: vec![read_tool()],
        };
        adapter.generate(&with_tools, &options).await.expect("ok");

        let without_tools = Context {
            system_prompt: Some("Be helpful.".to_string()),
            messages: vec![Message::user("hi")],
            tools: Vec::new(),
        };
        adapter.generate(&without_tools, &options).await.expect("ok");

        let captured = requests.lock().expect("lock");
        let first = captured[0].system_prompt.as_deref().expect("system prompt");
        assert!(first.starts_with("Be helpful."));
        assert!(first.contains("### Read"));
        assert_eq!(captured[1].system_prompt.as_deref(), Some("Be helpful."));
    }
}
