//! OpenAI Chat Completions over SSE.

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
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NAME: &str = "openai";
const DISPLAY_NAME: &str = "OpenAI";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DONE_SENTINEL: &str = "[DONE]";

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    redactor: Redactor,
}

impl OpenAiProvider {
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

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(
            "Authorization",
            format!("Bearer {}", self.api_key.expose_secret()),
        )
    }

    fn errors(&self) -> OpenAiErrors {
        OpenAiErrors {
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
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMsg>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSchema>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatMsg {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCallReq>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMsg {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ToolCallReq {
    id: String,
    #[serde(rename = "type")]
    r#type: &'static str,
    function: FunctionCallReq,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct FunctionCallReq {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ToolSchema {
    #[serde(rename = "type")]
    r#type: &'static str,
    function: FunctionSchema,
}

#[derive(Debug, Serialize)]
struct FunctionSchema {
    name: String,
    description: String,
    parameters: Value,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn convert_messages(
    system_prompt: Option<&str>,
    messages: &[Message],
) -> Result<Vec<ChatMsg>, ProviderError> {
    translate::validate_messages(messages)?;

    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        out.push(ChatMsg::text("system", system));
    }
    for (i, msg) in messages.iter().enumerate() {
        match &msg.role {
            Role::User => out.push(ChatMsg::text("user", &msg.content)),
            Role::Assistant => {
                let tool_calls: Vec<ToolCallReq> = msg
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallReq {
                        id: call.id.clone(),
                        r#type: "function",
                        function: FunctionCallReq {
                            name: call.name.clone(),
                            arguments: call.input.to_string(),
                        },
                    })
                    .collect();
                let content = if msg.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(msg.content.clone())
                };
                out.push(ChatMsg {
                    role: "assistant",
                    content,
                    tool_calls,
                    tool_call_id: None,
                });
            }
            Role::Tool => out.push(ChatMsg {
                role: "tool",
                content: Some(msg.content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: Some(translate::resolve_tool_call_id(messages, i)?),
            }),
            Role::Other(role) => return Err(ProviderError::invalid_role(role)),
        }
    }
    Ok(out)
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<ToolSchema> {
    translate::usable_tools(NAME, tools)
        .into_iter()
        .map(|t| ToolSchema {
            r#type: "function",
            function: FunctionSchema {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

fn build_request(request: &ChatRequest) -> Result<CompletionRequest, ProviderError> {
    Ok(CompletionRequest {
        model: request.model.clone(),
        messages: convert_messages(request.system_prompt.as_deref(), &request.messages)?,
        max_completion_tokens: request.max_tokens,
        temperature: request.temperature,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        tools: convert_tools(&request.tools),
    })
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct OpenAiErrors {
    redactor: Redactor,
}

impl Classify for OpenAiErrors {
    fn transport(&self, err: &reqwest::Error) -> ProviderError {
        ProviderError::from_transport(&self.redactor, DISPLAY_NAME, err)
    }

    fn status(&self, status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
        ProviderError::from_status(&self.redactor, DISPLAY_NAME, status, headers, body)
    }
}

/// Map an in-stream `error` object by its `code`, falling back to `type`.
fn classify_error_body(code: Option<&str>, error_type: Option<&str>) -> ErrorCode {
    let by_code = match code {
        Some("invalid_api_key") => Some(ErrorCode::AuthError),
        Some("rate_limit_exceeded") | Some("insufficient_quota") => Some(ErrorCode::RateLimit),
        Some("model_not_found") => Some(ErrorCode::ModelNotFound),
        Some("context_length_exceeded") => Some(ErrorCode::InvalidRequest),
        _ => None,
    };
    by_code.unwrap_or(match error_type {
        Some("authentication_error") | Some("permission_error") => ErrorCode::AuthError,
        Some("rate_limit_error") | Some("insufficient_quota") => ErrorCode::RateLimit,
        Some("invalid_request_error") => ErrorCode::InvalidRequest,
        Some("server_overloaded") => ErrorCode::Overloaded,
        _ => ErrorCode::ProviderError,
    })
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageResp>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<DeltaContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct UsageResp {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

/// One tool call being assembled, keyed by its `tool_calls[].index`.
struct OpenCall {
    id: String,
    name: String,
    started: bool,
    saw_delta: bool,
    /// Argument text that arrived before the name was known.
    pending: String,
}

/// Turns Chat Completions chunks into normalized chunks.
///
/// Tool-call fragments are routed by `index`, so calls whose deltas arrive
/// interleaved still come out as whole triples told apart by `tool_id`.
/// `tool_call_start` waits until the call's name is known.
pub(crate) struct OpenAiDecoder {
    model: String,
    redactor: Redactor,
    message_id: String,
    started: bool,
    done: bool,
    finish_seen: bool,
    next_index: u32,
    usage: Option<UsageStats>,
    open: BTreeMap<u32, OpenCall>,
}

impl OpenAiDecoder {
    pub(crate) fn new(model: &str, redactor: Redactor) -> Self {
        Self {
            model: model.to_string(),
            redactor,
            message_id: String::new(),
            started: false,
            done: false,
            finish_seen: false,
            next_index: 0,
            usage: None,
            open: BTreeMap::new(),
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamChunk>) {
        if self.started {
            return;
        }
        if self.message_id.is_empty() {
            self.message_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
        }
        self.started = true;
        out.push(StreamChunk::start(&self.message_id, &self.model));
    }

    fn close_all_calls(&mut self, out: &mut Vec<StreamChunk>) {
        for (index, mut call) in std::mem::take(&mut self.open) {
            if !call.started {
                if call.name.is_empty() {
                    tracing::debug!(provider = NAME, index, "dropping tool call that never named its function");
                    continue;
                }
                out.push(StreamChunk::tool_call_start(&self.message_id, &call.id, &call.name));
            }
            if !call.pending.is_empty() {
                out.push(StreamChunk::tool_call_delta(&self.message_id, &call.id, std::mem::take(&mut call.pending)));
            } else if !call.saw_delta {
                out.push(StreamChunk::tool_call_delta(&self.message_id, &call.id, "{}"));
            }
            out.push(StreamChunk::tool_call_end(&self.message_id, &call.id));
        }
    }

    fn tool_delta(&mut self, delta: ToolCallDelta, out: &mut Vec<StreamChunk>) {
        let (name, arguments) = match delta.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };

        let call = self.open.entry(delta.index).or_insert_with(|| OpenCall {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: String::new(),
            started: false,
            saw_delta: false,
            pending: String::new(),
        });
        if !call.started {
            if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                call.id = id;
            }
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                call.name = name;
            }
        }
        let fragment = arguments.unwrap_or_default();

        if !call.started {
            if call.name.is_empty() {
                call.pending.push_str(&fragment);
                return;
            }
            call.started = true;
            out.push(StreamChunk::tool_call_start(&self.message_id, &call.id, &call.name));
            if !call.pending.is_empty() {
                call.saw_delta = true;
                out.push(StreamChunk::tool_call_delta(&self.message_id, &call.id, std::mem::take(&mut call.pending)));
            }
        }

        if !fragment.is_empty() {
            call.saw_delta = true;
            out.push(StreamChunk::tool_call_delta(&self.message_id, &call.id, fragment));
        }
    }

    fn complete(&mut self, out: &mut Vec<StreamChunk>) {
        self.ensure_started(out);
        self.close_all_calls(out);
        let usage = self.usage.unwrap_or_default();
        tracing::info!(
            provider = NAME,
            message_id = %self.message_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "stream complete"
        );
        out.push(StreamChunk::end(&self.message_id, &self.model, Some(usage)));
        self.done = true;
    }
}

impl Decoder for OpenAiDecoder {
    fn decode(&mut self, _event: &str, data: &str) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        if data.trim() == DONE_SENTINEL {
            self.complete(&mut out);
            return out;
        }
        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(provider = NAME, error = %e, "skipping malformed chunk");
                return out;
            }
        };

        if let Some(error) = chunk.error {
            let code_text = error.code.as_ref().and_then(|c| c.as_str().map(String::from));
            let code = classify_error_body(code_text.as_deref(), error.error_type.as_deref());
            let err = ProviderError::new(
                &self.redactor,
                code,
                error.message,
                super::error::default_user_message(code, DISPLAY_NAME),
            );
            tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
            out.push(self.fail(&err));
            return out;
        }

        if !self.started {
            if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
                self.message_id = id;
            }
            if let Some(model) = chunk.model.filter(|m| !m.is_empty()) {
                self.model = model;
            }
        }
        self.ensure_started(&mut out);

        if let Some(usage) = chunk.usage {
            self.usage = Some(UsageStats {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    out.push(StreamChunk::text(&self.message_id, self.next_index, text));
                    self.next_index += 1;
                }
                for call in delta.tool_calls {
                    self.tool_delta(call, &mut out);
                }
            }
            if choice.finish_reason.is_some() {
                self.close_all_calls(&mut out);
                self.finish_seen = true;
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        // Some proxies drop the [DONE] sentinel; a finish_reason is enough.
        if self.finish_seen {
            self.complete(&mut out);
            return out;
        }
        let err = ProviderError::interrupted(&self.redactor, DISPLAY_NAME);
        tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
        out.push(self.fail(&err));
        out
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
impl Provider for OpenAiProvider {
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

        let http = self
            .authorized(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&body);
        let errors = self.errors();
        let decoder = OpenAiDecoder::new(&request.model, self.redactor.clone());
        Ok(stream::spawn_producer(NAME, cancel, move |mut sink| async move {
            if let Some(response) = stream::open(&mut sink, http, &errors).await {
                stream::pump_sse(&mut sink, response, decoder, &errors).await;
            }
        }))
    }

    async fn validate_credentials(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        self.ensure_credential()?;
        let errors = self.errors();
        cancellable(cancel, &self.redactor, DISPLAY_NAME, async {
            let response = self
                .authorized(self.client.get(format!("{}/models", self.base_url)))
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
        Ok(static_models::openai_models())
    }
}
