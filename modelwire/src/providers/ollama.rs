//! Local Ollama daemon, `/api/chat` streamed as newline-delimited JSON.

use super::error::{default_user_message, ErrorCode, ProviderError};
use super::sanitize::Redactor;
use super::stream::{self, ChunkReceiver, Classify, Decoder};
use super::translate;
use super::{cancellable, Provider};
use crate::types::*;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NAME: &str = "ollama";
const DISPLAY_NAME: &str = "Ollama";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const LIST_MODELS_TIMEOUT: Duration = Duration::from_secs(5);
/// Ollama does not report an output limit in `/api/tags`.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    redactor: Redactor,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            base_url,
            redactor: Redactor::default(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn errors(&self) -> OllamaErrors {
        OllamaErrors {
            redactor: self.redactor.clone(),
        }
    }

    async fn fetch_tags(&self) -> Result<TagsResponse, ProviderError> {
        let errors = self.errors();
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(LIST_MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|e| errors.transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(errors.status(status.as_u16(), &headers, &text));
        }
        response.json().await.map_err(|e| errors.transport(&e))
    }
}

// ---------------------------------------------------------------------------
// Request wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatBody {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
    options: ChatOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
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

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

fn convert_messages(
    system_prompt: Option<&str>,
    messages: &[Message],
) -> Result<Vec<OllamaMessage>, ProviderError> {
    translate::validate_messages(messages)?;

    let mut out = Vec::with_capacity(messages.len() + 1);
    let plain = |role, content: &str| OllamaMessage {
        role,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_name: None,
    };
    if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
        out.push(plain("system", system));
    }
    for msg in messages {
        match &msg.role {
            Role::User => out.push(plain("user", &msg.content)),
            Role::Assistant => out.push(OllamaMessage {
                tool_calls: msg
                    .tool_calls
                    .iter()
                    .map(|call| OllamaToolCall {
                        function: OllamaFunction {
                            name: call.name.clone(),
                            arguments: call.input.clone(),
                        },
                    })
                    .collect(),
                ..plain("assistant", &msg.content)
            }),
            Role::Tool => out.push(OllamaMessage {
                tool_name: Some(translate::tool_name(msg)?.to_string()),
                ..plain("tool", &msg.content)
            }),
            Role::Other(role) => return Err(ProviderError::invalid_role(role)),
        }
    }
    Ok(out)
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OllamaTool> {
    translate::usable_tools(NAME, tools)
        .into_iter()
        .map(|t| OllamaTool {
            r#type: "function",
            function: FunctionSchema {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

fn build_request(request: &ChatRequest) -> Result<ChatBody, ProviderError> {
    Ok(ChatBody {
        model: request.model.clone(),
        messages: convert_messages(request.system_prompt.as_deref(), &request.messages)?,
        stream: true,
        tools: convert_tools(&request.tools),
        options: ChatOptions {
            num_predict: request.max_tokens,
            temperature: request.temperature,
        },
    })
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct OllamaErrors {
    redactor: Redactor,
}

impl OllamaErrors {
    fn in_stream(&self, text: &str) -> ProviderError {
        let code = if text.contains("not found") {
            ErrorCode::ModelNotFound
        } else {
            ErrorCode::ProviderError
        };
        ProviderError::new(&self.redactor, code, text, default_user_message(code, DISPLAY_NAME))
    }
}

impl Classify for OllamaErrors {
    fn transport(&self, err: &reqwest::Error) -> ProviderError {
        if err.is_connect() {
            return ProviderError::new(
                &self.redactor,
                ErrorCode::ConnectionError,
                err.to_string(),
                "Could not connect to Ollama. Make sure the Ollama server is running.",
            );
        }
        if err.is_timeout() {
            return ProviderError::new(
                &self.redactor,
                ErrorCode::Timeout,
                err.to_string(),
                default_user_message(ErrorCode::Timeout, DISPLAY_NAME),
            );
        }
        ProviderError::from_transport(&self.redactor, DISPLAY_NAME, err)
    }

    fn status(&self, status: u16, headers: &HeaderMap, body: &str) -> ProviderError {
        ProviderError::from_status(&self.redactor, DISPLAY_NAME, status, headers, body)
    }
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

/// Each NDJSON line stands alone. Ollama sends no message id, so one is
/// generated per stream.
pub(crate) struct OllamaDecoder {
    model: String,
    errors: OllamaErrors,
    message_id: String,
    started: bool,
    done: bool,
    next_index: u32,
}

impl OllamaDecoder {
    fn new(model: &str, errors: OllamaErrors) -> Self {
        Self {
            model: model.to_string(),
            errors,
            message_id: format!("ollama-{}", Uuid::new_v4().simple()),
            started: false,
            done: false,
            next_index: 0,
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamChunk>) {
        if !self.started {
            self.started = true;
            out.push(StreamChunk::start(&self.message_id, &self.model));
        }
    }
}

impl Decoder for OllamaDecoder {
    fn decode(&mut self, _event: &str, data: &str) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        let line: ChatLine = match serde_json::from_str(data) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(provider = NAME, error = %e, "skipping malformed line");
                return out;
            }
        };

        if let Some(error) = line.error {
            let err = self.errors.in_stream(&error);
            tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
            out.push(self.fail(&err));
            return out;
        }

        self.ensure_started(&mut out);

        if let Some(message) = line.message {
            for call in message.tool_calls {
                let id = format!("call_{}", Uuid::new_v4().simple());
                let args = match call.function.arguments {
                    Value::Object(map) => Value::Object(map).to_string(),
                    Value::String(raw) => translate::parse_arguments(&raw).to_string(),
                    _ => "{}".to_string(),
                };
                out.push(StreamChunk::tool_call_start(&self.message_id, &id, &call.function.name));
                out.push(StreamChunk::tool_call_delta(&self.message_id, &id, args));
                out.push(StreamChunk::tool_call_end(&self.message_id, &id));
            }
            if !message.content.is_empty() {
                out.push(StreamChunk::text(&self.message_id, self.next_index, message.content));
                self.next_index += 1;
            }
        }

        if line.done {
            let usage = UsageStats {
                input_tokens: line.prompt_eval_count.unwrap_or_default(),
                output_tokens: line.eval_count.unwrap_or_default(),
            };
            let model = line.model.filter(|m| !m.is_empty()).unwrap_or_else(|| self.model.clone());
            tracing::info!(
                provider = NAME,
                message_id = %self.message_id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "stream complete"
            );
            out.push(StreamChunk::end(&self.message_id, &model, Some(usage)));
            self.done = true;
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        if self.done {
            return Vec::new();
        }
        let err = ProviderError::interrupted(&self.errors.redactor, DISPLAY_NAME);
        tracing::warn!(provider = NAME, code = %err.code, "{}", err.message);
        vec![self.fail(&err)]
    }

    fn fail(&mut self, err: &ProviderError) -> StreamChunk {
        self.done = true;
        let id = if self.started { self.message_id.as_str() } else { "" };
        StreamChunk::error(id, err.code, &err.user_message)
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// /api/tags
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    model: Option<String>,
}

// ---------------------------------------------------------------------------
// Provider impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn send_message(
        &self,
        cancel: CancellationToken,
        request: ChatRequest,
    ) -> Result<ChunkReceiver, ProviderError> {
        let body = build_request(&request)?;

        tracing::debug!(
            provider = NAME,
            model = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "sending message"
        );

        let http = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body);
        let errors = self.errors();
        let decoder = OllamaDecoder::new(&request.model, errors.clone());
        Ok(stream::spawn_producer(NAME, cancel, move |mut sink| async move {
            if let Some(response) = stream::open(&mut sink, http, &errors).await {
                stream::pump_ndjson(&mut sink, response, decoder, &errors).await;
            }
        }))
    }

    /// Ollama has no credentials; reaching `/api/tags` is the check.
    async fn validate_credentials(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        cancellable(cancel, &self.redactor, DISPLAY_NAME, async {
            self.fetch_tags().await.map(|_| ())
        })
        .await
    }

    async fn list_models(&self) -> Result<Vec<Model>, ProviderError> {
        let tags = self.fetch_tags().await?;
        Ok(tags
            .models
            .into_iter()
            .map(|entry| {
                let id = entry.model.filter(|m| !m.is_empty()).unwrap_or(entry.name.clone());
                Model {
                    id,
                    name: entry.name,
                    provider: NAME.to_string(),
                    max_tokens: DEFAULT_MAX_TOKENS,
                    supports_tools: true,
                }
            })
            .collect())
    }
}
