//! textcall - tool calling over a plain-text model channel.
//!
//! Adapts a model that only accepts and produces plain text (a CLI-driven
//! coding model) to a tool-calling conversation protocol:
//! - [`schema`] renders the tool catalog into a textual protocol prompt,
//! - [`history`] decides which conversation turns to re-send and detects
//!   rewound/edited history via message fingerprints,
//! - [`blocks`] incrementally parses the embedded envelope grammar,
//! - [`adapter`] drives the model and assembles the streamed response.
//!
//! The adapter is stateless between calls: session continuity data travels
//! in [`model::SessionMeta`] on every response and must be passed back in
//! the next call's [`provider::StreamOptions`].

#![forbid(unsafe_code)]

pub mod adapter;
pub mod blocks;
pub mod error;
pub mod history;
pub mod model;
pub mod provider;
pub mod schema;
pub mod text_model;

pub use adapter::TextToolAdapter;
pub use error::{Error, Result};
pub use model::{
    AssistantMessage, ContentBlock, Message, SessionMeta, StopReason, StreamEvent, ToolCall, Usage,
};
pub use provider::{Completion, Context, Provider, StreamOptions, ToolDef};
pub use text_model::{TextModel, TextModelEvent, TextRequest};
