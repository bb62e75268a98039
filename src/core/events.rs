//! Events streamed to the caller during one chat turn.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An image returned by a tool, either inline or by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolImage {
    #[serde(rename_all = "camelCase")]
    Inline { data: String, mime_type: String },
    #[serde(rename_all = "camelCase")]
    Remote { url: String, mime_type: String },
}

impl ToolImage {
    pub fn mime_type(&self) -> &str {
        match self {
            ToolImage::Inline { mime_type, .. } | ToolImage::Remote { mime_type, .. } => mime_type,
        }
    }
}

/// One tool invocation within a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,
    pub server_id: String,
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Wall-clock milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ToolImage>,
}

impl ToolCallRecord {
    pub fn pending(
        name: impl Into<String>,
        server_id: impl Into<String>,
        args: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            server_id: server_id.into(),
            args,
            result: None,
            duration: None,
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    ToolCall(ToolCallRecord),
    ToolResult(ToolCallRecord),
    Text {
        text: String,
    },
    Error {
        message: String,
    },
    Done {
        #[serde(rename = "toolCalls")]
        tool_calls: Vec<ToolCallRecord>,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::ToolCall(_) => "tool_call",
            ChatEvent::ToolResult(_) => "tool_result",
            ChatEvent::Text { .. } => "text",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Done { .. } => "done",
        }
    }
}
