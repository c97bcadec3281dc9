//! Per-provider configuration and credential resolution.

use crate::providers::{
    http_client, ClaudeProvider, GeminiProvider, OllamaProvider, OpenAiProvider, Provider,
    ProviderError,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    OpenAi,
    Gemini,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Claude,
        ProviderKind::OpenAi,
        ProviderKind::Gemini,
        ProviderKind::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Environment variables holding the credential, in lookup order.
    fn key_env_vars(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Claude => &["ANTHROPIC_API_KEY"],
            ProviderKind::OpenAi => &["OPENAI_API_KEY"],
            ProviderKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            ProviderKind::Ollama => &[],
        }
    }

    fn endpoint_env_var(self) -> Option<&'static str> {
        match self {
            ProviderKind::Ollama => Some("OLLAMA_HOST"),
            _ => None,
        }
    }

    pub fn requires_key(self) -> bool {
        !self.key_env_vars().is_empty()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider {0:?}; expected one of: claude, openai, gemini, ollama")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderKind {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "ollama" => Ok(ProviderKind::Ollama),
            _ => Err(UnknownProvider(s.to_string())),
        }
    }
}

/// Credential, endpoint and timeouts for one backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Whole-request limit, streaming included. Unset means no limit.
    #[serde(default, deserialize_with = "deserialize_secs")]
    pub request_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_secs")]
    pub connect_timeout: Option<Duration>,
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64))
}

/// Resolve a credential: an explicit non-blank override wins, then the
/// backend's environment variables in order.
pub fn resolve_credential(kind: ProviderKind, override_key: Option<&str>) -> Option<SecretString> {
    if let Some(raw) = override_key {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Some(SecretString::from(trimmed.to_owned()));
        }
    }

    for &env_var in kind.key_env_vars() {
        if let Ok(val) = std::env::var(env_var) {
            let val = val.trim();
            if !val.is_empty() {
                return Some(SecretString::from(val.to_owned()));
            }
        }
    }

    None
}

/// `OLLAMA_HOST` may be a bare `host:port`.
fn normalize_endpoint(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: None,
            base_url: None,
            request_timeout: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    /// Configuration drawn from the environment.
    pub fn from_env(kind: ProviderKind) -> Self {
        let base_url = kind
            .endpoint_env_var()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.trim().is_empty())
            .map(|v| normalize_endpoint(&v));
        Self {
            api_key: resolve_credential(kind, None),
            base_url,
            ..Self::new(kind)
        }
    }

    /// Replace the credential when `key` is non-blank.
    pub fn with_api_key_override(mut self, key: Option<&str>) -> Self {
        if let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) {
            self.api_key = Some(SecretString::from(key.to_owned()));
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Construct the provider. Hosted backends require a non-blank key.
    pub fn build(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        let client = http_client(self.request_timeout, self.connect_timeout)?;
        let base_url = self.base_url.clone();

        let key = || -> Result<SecretString, ProviderError> {
            match &self.api_key {
                Some(key) if !key.expose_secret().trim().is_empty() => Ok(key.clone()),
                _ => Err(ProviderError::missing_credential(self.kind.as_str())),
            }
        };

        tracing::debug!(provider = %self.kind, base_url = ?base_url, "building provider");
        let provider: Arc<dyn Provider> = match self.kind {
            ProviderKind::Claude => Arc::new(ClaudeProvider::new(key()?, base_url).with_client(client)),
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(key()?, base_url).with_client(client)),
            ProviderKind::Gemini => Arc::new(GeminiProvider::new(key()?, base_url).with_client(client)),
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(base_url).with_client(client)),
        };
        Ok(provider)
    }
}
