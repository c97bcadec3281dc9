use serde::{Deserialize, Serialize};
use std::fmt;

use crate::providers::error::ErrorCode;

// ---------------------------------------------------------------------------
// Roles & messages
// ---------------------------------------------------------------------------

/// Conversation role of a [`Message`].
///
/// Only `user`, `assistant` and `tool` are accepted by providers; anything
/// else deserializes into `Other` and is rejected with `invalid_role` before
/// any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    #[serde(untagged)]
    Other(String),
}

impl Role {
    /// Roles every provider accepts inside the message list.
    pub const ACCEPTED: [&'static str; 3] = ["user", "assistant", "tool"];

    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Other(s) => s,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation requested by the model in an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Decoded JSON input for the tool.
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Tool invocations requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Which tool produced this result (tool turns only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Id of the originating call. When absent, backends that need it resolve
    /// the id from the latest preceding assistant call with the same name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<Role>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that requested one or more tool calls.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Result of a tool execution, fed back to the model.
    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool parameters.
    pub parameters: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32, messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: model.into(),
            max_tokens,
            system_prompt: None,
            tools: Vec::new(),
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

// ---------------------------------------------------------------------------
// Usage & models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A model a provider can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    /// Human-friendly display name.
    pub name: String,
    /// Provider tag, e.g. "claude" or "ollama".
    pub provider: String,
    /// Maximum output tokens.
    pub max_tokens: u32,
    pub supports_tools: bool,
}

// ---------------------------------------------------------------------------
// Stream chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Start,
    Chunk,
    ToolCallStart,
    ToolCallDelta,
    ToolCallEnd,
    End,
    Error,
}

impl ChunkType {
    /// True for `end` and `error`, the events that finish a stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkType::End | ChunkType::Error)
    }
}

/// One normalized unit of stream progress.
///
/// A successful stream is `start`, then text chunks and tool-call triples,
/// then exactly one `end` or `error`. The channel closing is the completion
/// signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub kind: ChunkType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    /// Position of a text chunk in the stream; 0 for every other type.
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl StreamChunk {
    fn bare(kind: ChunkType, message_id: &str) -> Self {
        Self {
            kind,
            content: String::new(),
            message_id: message_id.to_string(),
            index: 0,
            usage: None,
            model: String::new(),
            tool_id: String::new(),
            tool_name: String::new(),
            error_code: None,
        }
    }

    pub fn start(message_id: &str, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::bare(ChunkType::Start, message_id)
        }
    }

    pub fn text(message_id: &str, index: u32, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            index,
            ..Self::bare(ChunkType::Chunk, message_id)
        }
    }

    pub fn tool_call_start(message_id: &str, tool_id: &str, tool_name: &str) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            ..Self::bare(ChunkType::ToolCallStart, message_id)
        }
    }

    pub fn tool_call_delta(message_id: &str, tool_id: &str, fragment: impl Into<String>) -> Self {
        Self {
            content: fragment.into(),
            tool_id: tool_id.to_string(),
            ..Self::bare(ChunkType::ToolCallDelta, message_id)
        }
    }

    pub fn tool_call_end(message_id: &str, tool_id: &str) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            ..Self::bare(ChunkType::ToolCallEnd, message_id)
        }
    }

    pub fn end(message_id: &str, model: &str, usage: Option<UsageStats>) -> Self {
        Self {
            model: model.to_string(),
            usage,
            ..Self::bare(ChunkType::End, message_id)
        }
    }

    /// Terminal error chunk. Only the display-safe text travels on the stream.
    pub fn error(message_id: &str, code: ErrorCode, user_message: &str) -> Self {
        Self {
            content: user_message.to_string(),
            error_code: Some(code),
            ..Self::bare(ChunkType::Error, message_id)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
