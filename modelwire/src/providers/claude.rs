//! Anthropic Messages API over SSE.

use super::error::{ErrorCode, ProviderError};
use super::sanitize::Redactor;
use super::stream::{self, ChunkReceiver, Classify, Decoder};
use super::translate;
use super::{cancellable, Provider};
use crate::models::static_models;
use crate::types::*;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NAME: &str = "claude";
const DISPLAY_NAME: &str = "Claude";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const VALIDATION_MODEL: &str = "claude-3-5-haiku-latest";

pub struct ClaudeProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    redactor: Redactor,
}

impl ClaudeProvider {
    pub fn new(api_key: SecretString, base_url: Option<String>) -> Self {
        let redactor = Redactor::new(Some(api_key.expose_secret()));
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            base_url,
            api_key,
            redactor,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn post_messages(&self, body: &MessagesRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }

    fn errors(&self) -> ClaudeErrors {
        ClaudeErrors {
            redactor: self.redactor.clone(),
        }
    }

    fn ensure_credential(&self) -> Result<(), ProviderError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(ProviderError::missing_credential(DISPLAY_NAME));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<ClaudeMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ClaudeTool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct ClaudeTool {
    name: String,
    description: String,
    input_schema: Value,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn convert_messages(messages: &[Message]) -> Result<Vec<ClaudeMessage>, ProviderError> {
    translate::validate_messages(messages)?;

    let mut out: Vec<ClaudeMessage> = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        match &msg.role {
            Role::User => out.push(ClaudeMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: msg.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut content = Vec::new();
                if !msg.content.is_empty() || msg.tool_calls.is_empty() {
                    content.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for call in &msg.tool_calls {
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                }
                out.push(ClaudeMessage {
                    role: "assistant",
                    content,
                });
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: translate::resolve_tool_call_id(messages, i)?,
                    content: msg.content.clone(),
                };
                // Results answering one assistant turn share a single user turn.
                match out.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block)
                    }
                    _ => out.push(ClaudeMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
            Role::Other(role) => return Err(ProviderError::invalid_role(role)),
        }
    }
    Ok(out)
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<ClaudeTool> {
    translate::usable_tools(NAME, tools)
        .into_iter()
        .map(|t| ClaudeTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.parameters.clone(),
        })
        .collect()
}

fn build_request(request: &ChatRequest) -> Result<MessagesRequest, ProviderError> {
    Ok(MessagesRequest {
        model: request.model.clone(),
        messages: convert_messages(&request.messages)?,
        max_tokens: request.max_tokens,
        system: request.system_prompt.clone().filter(|s| !s.is_empty()),
        temperature: request.temperature,
        stream: true,
        tools: convert_tools(&request.tools),
    })
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ClaudeErrors {
    redactor: Redactor,
}

impl Classify for ClaudeErrors {
    fn transport(&self, err: &reqwest::Error) -> ProviderError {
        ProviderError::from_transport(&self.redactor, DISPLAY_NAME, err)
    }

    fn status(&self, status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
        ProviderError::from_status(&self.redactor, DISPLAY_NAME, status, headers, body)
    }
}

/// Map the `error.type` of an in-stream `error` event.
fn classify_error_type(error_type: &str) -> ErrorCode {
    match error_type {
        "authentication_error" | "permission_error" => ErrorCode::AuthError,
        "rate_limit_error" => ErrorCode::RateLimit,
        "overloaded_error" => ErrorCode::Overloaded,
        "not_found_error" => ErrorCode::ModelNotFound,
        "invalid_request_error" | "request_too_large" => ErrorCode::InvalidRequest,
        "timeout_error" => ErrorCode::Timeout,
        _ => ErrorCode::ProviderError,
    }
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    message: Option<MessageStart>,
    #[serde(default)]
    content_block: Option<ContentBlockStart>,
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct MessageStart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

struct OpenTool {
    id: String,
    saw_delta: bool,
}

/// Turns Anthropic SSE events into normalized chunks.
///
/// Tool calls are keyed by content-block index; a block that closes without
/// any `input_json_delta` still gets one `{}` delta so every triple is whole.
pub(crate) struct ClaudeDecoder {
    model: String,
    redactor: Redactor,
    message_id: String,
    started: bool,
    done: bool,
    next_index: u32,
    usage: UsageStats,
    open_tools: HashMap<u32, OpenTool>,
}

impl ClaudeDecoder {
    pub(crate) fn new(model: &str, redactor: Redactor) -> Self {
        Self {
            model: model.to_string(),
            redactor,
            message_id: String::new(),
            started: false,
            done: false,
            next_index: 0,
            usage: UsageStats::default(),
            open_tools: HashMap::new(),
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamChunk>) {
        if self.started {
            return;
        }
        if self.message_id.is_empty() {
            self.message_id = format!("msg_{}", Uuid::new_v4().simple());
        }
        self.started = true;
        out.push(StreamChunk::start(&self.message_id, &self.model));
    }

    fn absorb_usage(&mut self, usage: Usage) {
        if let Some(n) = usage.input_tokens {
            self.usage.input_tokens = n;
        }
        if let Some(n) = usage.output_tokens {
            self.usage.output_tokens = n;
        }
    }

    fn close_tool(&self, tool: OpenTool, out: &mut Vec<StreamChunk>) {
        if !tool.saw_delta {
            out.push(StreamChunk::tool_call_delta(&self.message_id, &tool.id, "{}"));
        }
        out.push(StreamChunk::tool_call_end(&self.message_id, &tool.id));
    }

    fn close_all_tools(&mut self, out: &mut Vec<StreamChunk>) {
        let mut open: Vec<_> = self.open_tools.drain().collect();
        open.sort_by_key(|(index, _)| *index);
        for (_, tool) in open {
            self.close_tool(tool, out);
        }
    }
}

impl Decoder for ClaudeDecoder {
    fn decode(&mut self, _event: &str, data: &str) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(provider = NAME, error = %e, "skipping malformed event");
                return out;
            }
        };

        match event.event_type.as_str() {
            "message_start" => {
                if let Some(message) = event.message {
                    if !self.started {
                        if let Some(id) = message.id.filter(|id| !id.is_empty()) {
                            self.message_id = id;
                        }
                        if let Some(model) = message.model.filter(|m| !m.is_empty()) {
                            self.model = model;
                        }
                    }
                    if let Some(usage) = message.usage {
                        self.absorb_usage(usage);
                    }
                }
                self.ensure_started(&mut out);
            }
            "content_block_start" => {
                let Some(block) = event.content_block else {
                    return out;
                };
                if block.block_type != "tool_use" {
                    return out;
                }
                self.ensure_started(&mut out);
                let id = block
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()));
                let name = block.name.unwrap_or_default();
                out.push(StreamChunk::tool_call_start(&self.message_id, &id, &name));
                self.open_tools.insert(
                    event.index.unwrap_or(0),
                    OpenTool {
                        id,
                        saw_delta: false,
                    },
                );
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return out;
                };
                if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                    self.ensure_started(&mut out);
                    out.push(StreamChunk::text(&self.message_id, self.next_index, text));
                    self.next_index += 1;
                }
                if let Some(fragment) = delta.partial_json.filter(|f| !f.is_empty()) {
                    let index = event.index.unwrap_or(0);
                    if let Some(tool) = self.open_tools.get_mut(&index) {
                        tool.saw_delta = true;
                        out.push(StreamChunk::tool_call_delta(&self.message_id, &tool.id, fragment));
                    }
                }
            }
            "content_block_stop" => {
                if let Some(tool) = event.index.and_then(|i| self.open_tools.remove(&i)) {
                    self.close_tool(tool, &mut out);
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage {
                    self.absorb_usage(usage);
                }
            }
            "message_stop" => {
                self.ensure_started(&mut out);
                self.close_all_tools(&mut out);
                tracing::info!(
                    provider = NAME,
                    message_id = %self.message_id,
                    input_tokens = self.usage.input_tokens,
                    output_tokens = self.usage.output_tokens,
                    "stream complete"
                );
                out.push(StreamChunk::end(&self.message_id, &self.model, Some(self.usage)));
                self.done = true;
            }
            "error" => {
                let (error_type, message) = event
                    .error
                    .map(|e| (e.error_type, e.message))
                    .unwrap_or_default();
                let code = classify_error_type(&error_type);
                let err = ProviderError::new(
                    &self.redactor,
                    code,
                    format!("{}: {}", error_type, message),
                    super::error::default_user_message(code, DISPLAY_NAME),
                );
                tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
                out.push(self.fail(&err));
            }
            _ => {}
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        let err = ProviderError::interrupted(&self.redactor, DISPLAY_NAME);
        tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
        vec![self.fail(&err)]
    }

    fn fail(&mut self, err: &ProviderError) -> StreamChunk {
        self.done = true;
        StreamChunk::error(&self.message_id, err.code, &err.user_message)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// Provider impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn send_message(
        &self,
        cancel: CancellationToken,
        request: ChatRequest,
    ) -> Result<ChunkReceiver, ProviderError> {
        let body = build_request(&request)?;
        self.ensure_credential()?;

        tracing::debug!(
            provider = NAME,
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "sending message"
        );

        let http = self.post_messages(&body);
        let errors = self.errors();
        let decoder = ClaudeDecoder::new(&request.model, self.redactor.clone());
        Ok(stream::spawn_producer(NAME, cancel, move |mut sink| async move {
            if let Some(response) = stream::open(&mut sink, http, &errors).await {
                stream::pump_sse(&mut sink, response, decoder, &errors).await;
            }
        }))
    }

    async fn validate_credentials(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.ensure_credential()?;
        let body = MessagesRequest {
            model: VALIDATION_MODEL.to_string(),
            messages: vec![ClaudeMessage {
                role: "user",
                content: vec![ContentBlock::Text { text: "ping".into() }],
            }],
            max_tokens: 1,
            system: None,
            temperature: None,
            stream: false,
            tools: Vec::new(),
        };
        let errors = self.errors();
        cancellable(cancel, &self.redactor, DISPLAY_NAME, async {
            let response = self
                .post_messages(&body)
                .send()
                .await
                .map_err(|e| errors.transport(&e))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            Err(errors.status(status.as_u16(), &headers, &text))
        })
        .await
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        Ok(static_models::claude_models())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(decoder: &mut ClaudeDecoder, events: &[Value]) -> Vec<StreamChunk> {
        events
            .iter()
            .flat_map(|e| decoder.decode("", &e.to_string()))
            .collect()
    }

    fn kinds(chunks: &[StreamChunk]) -> Vec<ChunkType> {
        chunks.iter().map(|c| c.kind).collect()
    }

    #[test]
    fn plain_text_stream() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        let chunks = decode_all(
            &mut d,
            &[
                json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 10}}}),
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
                json!({"type": "content_block_stop", "index": 0}),
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
                json!({"type": "message_stop"}),
            ],
        );
        assert_eq!(
            kinds(&chunks),
            vec![ChunkType::Start, ChunkType::Chunk, ChunkType::Chunk, ChunkType::End]
        );
        assert_eq!(chunks[0].message_id, "msg_1");
        assert_eq!(chunks[1].index, 0);
        assert_eq!(chunks[2].index, 1);
        assert_eq!(
            chunks[3].usage,
            Some(UsageStats {
                input_tokens: 10,
                output_tokens: 2
            })
        );
        assert!(d.is_done());
        assert!(d.finish().is_empty());
    }

    #[test]
    fn tool_use_block_becomes_a_triple() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        let chunks = decode_all(
            &mut d,
            &[
                json!({"type": "message_start", "message": {"id": "msg_2"}}),
                json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "file_read", "input": {}}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": ""}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\":"}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"a.txt\"}"}}),
                json!({"type": "content_block_stop", "index": 1}),
                json!({"type": "message_stop"}),
            ],
        );
        assert_eq!(
            kinds(&chunks),
            vec![
                ChunkType::Start,
                ChunkType::ToolCallStart,
                ChunkType::ToolCallDelta,
                ChunkType::ToolCallDelta,
                ChunkType::ToolCallEnd,
                ChunkType::End
            ]
        );
        assert_eq!(chunks[1].tool_name, "file_read");
        assert!(chunks[1..5].iter().all(|c| c.tool_id == "toolu_1"));
        let joined: String = chunks[2..4].iter().map(|c| c.content.as_str()).collect();
        assert_eq!(translate::parse_arguments(&joined), json!({"path": "a.txt"}));
    }

    #[test]
    fn argumentless_tool_still_gets_a_delta() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        let chunks = decode_all(
            &mut d,
            &[
                json!({"type": "message_start", "message": {"id": "msg_3"}}),
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_9", "name": "now"}}),
                json!({"type": "content_block_stop", "index": 0}),
                json!({"type": "message_stop"}),
            ],
        );
        assert_eq!(chunks[2].kind, ChunkType::ToolCallDelta);
        assert_eq!(chunks[2].content, "{}");
        assert_eq!(chunks[3].kind, ChunkType::ToolCallEnd);
    }

    #[test]
    fn eof_before_message_stop_is_a_connection_error() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        decode_all(
            &mut d,
            &[
                json!({"type": "message_start", "message": {"id": "msg_4"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"text": "partial"}}),
            ],
        );
        let tail = d.finish();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind, ChunkType::Error);
        assert_eq!(tail[0].error_code, Some(ErrorCode::ConnectionError));
        assert_eq!(tail[0].message_id, "msg_4");
    }

    #[test]
    fn in_stream_error_event_is_classified_and_terminal() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        let chunks = decode_all(
            &mut d,
            &[
                json!({"type": "message_start", "message": {"id": "msg_5"}}),
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"text": "ghost"}}),
            ],
        );
        assert_eq!(kinds(&chunks), vec![ChunkType::Start, ChunkType::Error]);
        assert_eq!(chunks[1].error_code, Some(ErrorCode::Overloaded));
    }

    #[test]
    fn error_inside_a_tool_call_leaves_it_open() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        let mut chunks = decode_all(
            &mut d,
            &[
                json!({"type": "message_start", "message": {"id": "msg_6"}}),
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_6", "name": "file_read"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"pa"}}),
            ],
        );
        chunks.extend(d.finish());
        assert_eq!(
            kinds(&chunks),
            vec![ChunkType::Start, ChunkType::ToolCallStart, ChunkType::ToolCallDelta, ChunkType::Error]
        );
    }

    #[test]
    fn malformed_and_unknown_events_are_skipped() {
        let mut d = ClaudeDecoder::new("claude-x", Redactor::default());
        assert!(d.decode("", "{not json").is_empty());
        assert!(d.decode("ping", r#"{"type":"ping"}"#).is_empty());
        assert!(!d.is_done());
    }

    #[test]
    fn tool_results_merge_into_one_user_turn() {
        let msgs = vec![
            Message::user("read both"),
            Message::assistant_with_tools(
                "",
                vec![
                    ToolCall { id: "t1".into(), name: "a".into(), input: json!({}) },
                    ToolCall { id: "t2".into(), name: "b".into(), input: json!({}) },
                ],
            ),
            Message::tool_result("a", "A"),
            Message::tool_result("b", "B"),
        ];
        let out = convert_messages(&msgs).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].content.len(), 2);
        assert_eq!(
            out[2].content,
            vec![
                ContentBlock::ToolResult { tool_use_id: "t1".into(), content: "A".into() },
                ContentBlock::ToolResult { tool_use_id: "t2".into(), content: "B".into() },
            ]
        );
    }

    #[test]
    fn system_prompt_goes_to_system_field() {
        let req = ChatRequest::new("claude-x", 64, vec![Message::user("hi")]).with_system_prompt("be brief");
        let body = serde_json::to_value(build_request(&req).unwrap()).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn unsupported_role_fails_before_io() {
        let req = ChatRequest::new("claude-x", 64, vec![Message::new("system", "x")]);
        assert_eq!(build_request(&req).unwrap_err().code, ErrorCode::InvalidRole);
    }
}
