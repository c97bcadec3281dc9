//! Google Generative Language API (`streamGenerateContent`, SSE framing).
//!
//! Gemini reports failures as free-form text far more often than as a
//! structured status, so classification here is an ordered substring rule
//! table rather than a status map.

use super::error::{default_user_message, ErrorCode, ProviderError};
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
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NAME: &str = "gemini";
const DISPLAY_NAME: &str = "Gemini";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Schema keywords the function-declaration endpoint rejects.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 3] = ["$schema", "additionalProperties", "$id"];

pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    redactor: Redactor,
}

impl GeminiProvider {
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

    /// The key travels in a header so it never shows up in URLs or in
    /// `reqwest` error text.
    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("x-goog-api-key", self.api_key.expose_secret())
    }

    fn errors(&self) -> GeminiErrors {
        GeminiErrors {
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
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<ContentReq>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ContentReq>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclaration>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ContentReq {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<PartReq>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
enum PartReq {
    Text(String),
    FunctionCall { name: String, args: Value },
    FunctionResponse { name: String, response: Value },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclaration {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn convert_messages(messages: &[Message]) -> Result<Vec<ContentReq>, ProviderError> {
    translate::validate_messages(messages)?;

    let mut contents: Vec<ContentReq> = Vec::new();
    for msg in messages {
        match &msg.role {
            Role::User => contents.push(ContentReq {
                role: Some("user"),
                parts: vec![PartReq::Text(msg.content.clone())],
            }),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() || msg.tool_calls.is_empty() {
                    parts.push(PartReq::Text(msg.content.clone()));
                }
                for call in &msg.tool_calls {
                    parts.push(PartReq::FunctionCall {
                        name: call.name.clone(),
                        args: call.input.clone(),
                    });
                }
                contents.push(ContentReq {
                    role: Some("model"),
                    parts,
                });
            }
            Role::Tool => {
                let part = PartReq::FunctionResponse {
                    name: translate::tool_name(msg)?.to_string(),
                    response: function_response(&msg.content),
                };
                match contents.last_mut() {
                    Some(last)
                        if last.role == Some("user")
                            && last
                                .parts
                                .iter()
                                .all(|p| matches!(p, PartReq::FunctionResponse { .. })) =>
                    {
                        last.parts.push(part)
                    }
                    _ => contents.push(ContentReq {
                        role: Some("user"),
                        parts: vec![part],
                    }),
                }
            }
            Role::Other(role) => return Err(ProviderError::invalid_role(role)),
        }
    }
    Ok(contents)
}

/// `functionResponse.response` must be an object.
fn function_response(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => json!({ "result": content }),
    }
}

fn strip_unsupported_schema_keys(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            for key in UNSUPPORTED_SCHEMA_KEYS {
                map.remove(key);
            }
            for value in map.values_mut() {
                strip_unsupported_schema_keys(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_unsupported_schema_keys),
        _ => {}
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<ToolDeclaration> {
    let declarations: Vec<FunctionDeclaration> = translate::usable_tools(NAME, tools)
        .into_iter()
        .map(|t| {
            let mut parameters = t.parameters.clone();
            strip_unsupported_schema_keys(&mut parameters);
            FunctionDeclaration {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters,
            }
        })
        .collect();
    if declarations.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclaration {
            function_declarations: declarations,
        }]
    }
}

fn build_request(request: &ChatRequest) -> Result<GenerateRequest, ProviderError> {
    Ok(GenerateRequest {
        contents: convert_messages(&request.messages)?,
        system_instruction: request
            .system_prompt
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| ContentReq {
                role: None,
                parts: vec![PartReq::Text(s.to_string())],
            }),
        tools: convert_tools(&request.tools),
        generation_config: GenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
        },
    })
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Checked in order; the first rule with a matching needle wins.
const ERROR_RULES: &[(&[&str], ErrorCode)] = &[
    (
        &[
            "error 401",
            "error 403",
            "api key not valid",
            "api_key_invalid",
            "permission_denied",
            "unauthenticated",
        ],
        ErrorCode::AuthError,
    ),
    (
        &["error 429", "quota", "resource_exhausted", "rate limit"],
        ErrorCode::RateLimit,
    ),
    (
        &["error 503", "overloaded", "unavailable"],
        ErrorCode::Overloaded,
    ),
    (
        &["error 404", "not found", "not_found"],
        ErrorCode::ModelNotFound,
    ),
    (
        &["error 504", "error 408", "deadline", "timed out", "timeout"],
        ErrorCode::Timeout,
    ),
    (
        &["error 400", "invalid_argument", "failed_precondition"],
        ErrorCode::InvalidRequest,
    ),
    (
        &["connection refused", "dns error", "error trying to connect"],
        ErrorCode::ConnectionError,
    ),
];

/// Classify raw Gemini error text of the form `Error <status>: <detail>`.
pub fn classify_error_text(text: &str) -> ErrorCode {
    let lower = text.to_lowercase();
    ERROR_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, code)| *code)
        .unwrap_or(ErrorCode::ProviderError)
}

#[derive(Clone)]
struct GeminiErrors {
    redactor: Redactor,
}

impl GeminiErrors {
    fn classify_text(&self, text: String) -> ProviderError {
        let code = classify_error_text(&text);
        ProviderError::new(
            &self.redactor,
            code,
            text,
            default_user_message(code, DISPLAY_NAME),
        )
    }
}

impl Classify for GeminiErrors {
    fn transport(&self, err: &reqwest::Error) -> ProviderError {
        ProviderError::from_transport(&self.redactor, DISPLAY_NAME, err)
    }

    fn status(&self, status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
        self.classify_text(format!("Error {}: {}", status, body))
            .with_retry_after(super::error::retry_after_header(headers))
    }
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<ContentResp>,
}

#[derive(Deserialize)]
struct ContentResp {
    #[serde(default)]
    parts: Vec<PartResp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartResp {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    function_call: Option<FunctionCallResp>,
}

#[derive(Deserialize)]
struct FunctionCallResp {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Each response object carries whole text and function-call parts; usage is
/// a running total reported only on the final `end`. A clean EOF is the
/// terminal signal.
pub(crate) struct GeminiDecoder {
    model: String,
    errors: GeminiErrors,
    message_id: String,
    started: bool,
    done: bool,
    next_index: u32,
    usage: UsageStats,
}

impl GeminiDecoder {
    fn new(model: &str, errors: GeminiErrors) -> Self {
        Self {
            model: model.to_string(),
            errors,
            message_id: String::new(),
            started: false,
            done: false,
            next_index: 0,
            usage: UsageStats::default(),
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamChunk>) {
        if self.started {
            return;
        }
        if self.message_id.is_empty() {
            self.message_id = format!("gemini-{}", Uuid::new_v4().simple());
        }
        self.started = true;
        out.push(StreamChunk::start(&self.message_id, &self.model));
    }
}

impl Decoder for GeminiDecoder {
    fn decode(&mut self, _event: &str, data: &str) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        let response: GenerateContentResponse = match serde_json::from_str(data) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(provider = NAME, error = %e, "skipping malformed response object");
                return out;
            }
        };

        if let Some(error) = response.error {
            let text = format!(
                "Error {}: {} ({})",
                error.code.unwrap_or_default(),
                error.message,
                error.status.unwrap_or_default()
            );
            let err = self.errors.classify_text(text);
            tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
            out.push(self.fail(&err));
            return out;
        }

        if !self.started {
            if let Some(id) = response.response_id.filter(|id| !id.is_empty()) {
                self.message_id = id;
            }
            if let Some(model) = response.model_version.filter(|m| !m.is_empty()) {
                self.model = model;
            }
        }
        self.ensure_started(&mut out);

        if let Some(usage) = response.usage_metadata {
            if let Some(n) = usage.prompt_token_count {
                self.usage.input_tokens = n;
            }
            if let Some(n) = usage.candidates_token_count {
                self.usage.output_tokens = n;
            }
        }

        let parts = response
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts);
        for part in parts {
            if part.thought == Some(true) {
                continue;
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                out.push(StreamChunk::text(&self.message_id, self.next_index, text));
                self.next_index += 1;
            }
            if let Some(call) = part.function_call {
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                let args = match call.args {
                    Some(Value::Object(map)) => Value::Object(map).to_string(),
                    _ => "{}".to_string(),
                };
                out.push(StreamChunk::tool_call_start(&self.message_id, &id, &call.name));
                out.push(StreamChunk::tool_call_delta(&self.message_id, &id, args));
                out.push(StreamChunk::tool_call_end(&self.message_id, &id));
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.ensure_started(&mut out);
        tracing::info!(
            provider = NAME,
            message_id = %self.message_id,
            input_tokens = self.usage.input_tokens,
            output_tokens = self.usage.output_tokens,
            "stream complete"
        );
        out.push(StreamChunk::end(&self.message_id, &self.model, Some(self.usage)));
        self.done = true;
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
impl Provider for GeminiProvider {
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
            contents = body.contents.len(),
            "sending message"
        );

        let url = format!(
            "{}/models/{}:streamGenerateContent",
            self.base_url, request.model
        );
        let http = self
            .authorized(self.client.post(url))
            .query(&[("alt", "sse")])
            .json(&body);
        let errors = self.errors();
        let decoder = GeminiDecoder::new(&request.model, errors.clone());
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
        Ok(static_models::gemini_models())
    }
}
