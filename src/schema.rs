//! Tool protocol prompt rendering.
//!
//! Renders a tool catalog into the textual protocol description appended to
//! the system prompt. The model being adapted has no native tool-call
//! support, so the grammar it must emit is spelled out verbatim here and the
//! parser in [`crate::blocks`] interprets what comes back.

use crate::blocks::{
    ARGUMENTS_CLOSE, ARGUMENTS_OPEN, TEXT_CLOSE, TEXT_OPEN, TOOL_CALL_ID_CLOSE, TOOL_CALL_ID_OPEN,
    TOOL_NAME_CLOSE, TOOL_NAME_OPEN, TOOL_USE_CLOSE, TOOL_USE_OPEN,
};
use crate::provider::ToolDef;
use std::fmt::Write as _;

/// Render the tool-calling protocol section for a system prompt.
///
/// Pure function of the catalog: same tools in, same text out. Tools are
/// rendered in input order, each exactly once; the JSON-Schema `required`
/// list decides the required/optional annotation verbatim.
pub fn render_tool_protocol(tools: &[ToolDef]) -> String {
    let mut out = String::new();

    out.push_str("# Tool calling\n\n");
    out.push_str(
        "You can call tools, but you must follow this exact text protocol. \
         Your entire reply must consist only of the two envelope forms below.\n\n",
    );
    let _ = writeln!(
        out,
        "Wrap ALL free text, without exception, in a text envelope:\n\n\
         {TEXT_OPEN}your message here{TEXT_CLOSE}\n"
    );
    let _ = writeln!(
        out,
        "To invoke a tool, emit a tool envelope containing the tool name, a \
         call id that is unique within the conversation, and a JSON object \
         with the arguments:\n\n\
         {TOOL_USE_OPEN}\n\
         {TOOL_NAME_OPEN}tool name{TOOL_NAME_CLOSE}\n\
         {TOOL_CALL_ID_OPEN}unique id, e.g. call_1{TOOL_CALL_ID_CLOSE}\n\
         {ARGUMENTS_OPEN}{{\"param\": \"value\"}}{ARGUMENTS_CLOSE}\n\
         {TOOL_USE_CLOSE}\n"
    );
    out.push_str(
        "Rules:\n\
         - Never nest envelopes inside one another.\n\
         - Never omit a required parameter.\n\
         - Never send an empty arguments object {} when a tool declares parameters.\n\
         - Arguments must be a single valid JSON object.\n\n",
    );

    out.push_str("## Available tools\n");
    for tool in tools {
        let _ = write!(out, "\n### {}\n", tool.name);
        if !tool.description.is_empty() {
            let _ = writeln!(out, "{}", tool.description.trim_end());
        }
        render_parameters(&mut out, &tool.parameters);
    }

    out
}

/// Render the parameter list of one tool from its JSON-Schema object.
fn render_parameters(out: &mut String, schema: &serde_json::Value) {
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) else {
        out.push_str("Parameters: none. Send empty arguments: {}\n");
        return;
    };
    if properties.is_empty() {
        out.push_str("Parameters: none. Send empty arguments: {}\n");
        return;
    }

    out.push_str("Parameters:\n");
    for (name, prop) in properties {
        let kind = prop
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("object");
        let requirement = if required.contains(&name.as_str()) {
            "required"
        } else {
            "optional"
        };
        let _ = write!(out, "- {name} ({kind}, {requirement})");
        if let Some(description) = prop.get("description").and_then(|v| v.as_str()) {
            let _ = write!(out, ": {description}");
        }
        out.push('\n');
    }
}
