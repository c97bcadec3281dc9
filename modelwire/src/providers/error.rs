//! Canonical error taxonomy shared by every backend.
//!
//! Classifiers map backend signals (HTTP status, transport failures, error
//! text) onto [`ErrorCode`]; every [`ProviderError`] is scrubbed through the
//! owning provider's [`Redactor`] as it is built.

use super::sanitize::Redactor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    RateLimit,
    Overloaded,
    InvalidRequest,
    InvalidRole,
    InvalidToolResult,
    ModelNotFound,
    Timeout,
    ConnectionError,
    ProviderError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthError => "auth_error",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidRole => "invalid_role",
            ErrorCode::InvalidToolResult => "invalid_tool_result",
            ErrorCode::ModelNotFound => "model_not_found",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ConnectionError => "connection_error",
            ErrorCode::ProviderError => "provider_error",
        }
    }

    /// Transient conditions a caller may reasonably retry. The core itself
    /// never retries.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimit
                | ErrorCode::Overloaded
                | ErrorCode::Timeout
                | ErrorCode::ConnectionError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified provider failure.
///
/// `message` is internal detail suitable for logs; `user_message` is safe to
/// show. Neither ever contains the provider's credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    pub user_message: String,
    /// Delay the backend asked for (`Retry-After`), when it sent one.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Build an error, scrubbing both strings through `redactor`.
    pub fn new(
        redactor: &Redactor,
        code: ErrorCode,
        message: impl AsRef<str>,
        user_message: impl AsRef<str>,
    ) -> Self {
        Self {
            code,
            message: redactor.sanitize(message.as_ref()),
            user_message: redactor.scrub(user_message.as_ref()),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub(crate) fn invalid_role(role: &str) -> Self {
        Self::new(
            &Redactor::default(),
            ErrorCode::InvalidRole,
            format!(
                "unsupported message role {:?}; accepted roles: {}",
                role,
                crate::types::Role::ACCEPTED.join(", ")
            ),
            format!(
                "Message role \"{}\" is not supported. Use one of: {}.",
                role,
                crate::types::Role::ACCEPTED.join(", ")
            ),
        )
    }

    pub(crate) fn invalid_tool_result(detail: &str) -> Self {
        Self::new(
            &Redactor::default(),
            ErrorCode::InvalidToolResult,
            detail,
            "A tool result could not be matched to the tool that produced it.",
        )
    }

    pub(crate) fn invalid_request(detail: &str) -> Self {
        Self::new(
            &Redactor::default(),
            ErrorCode::InvalidRequest,
            detail,
            format!("Invalid request: {}", detail),
        )
    }

    /// Error for a non-success HTTP response, using the shared status table.
    pub(crate) fn from_status(
        redactor: &Redactor,
        backend: &str,
        status: u16,
        headers: &reqwest::header::HeaderMap,
        body: &str,
    ) -> Self {
        let code = classify_status(status);
        Self::new(
            redactor,
            code,
            format!("HTTP {}: {}", status, body),
            default_user_message(code, backend),
        )
        .with_retry_after(retry_after_header(headers))
    }

    /// Error for a failure below HTTP (connect, timeout, body read).
    pub(crate) fn from_transport(redactor: &Redactor, backend: &str, err: &reqwest::Error) -> Self {
        let code = classify_transport(err);
        Self::new(redactor, code, err.to_string(), default_user_message(code, backend))
    }

    pub(crate) fn missing_credential(backend: &str) -> Self {
        Self::new(
            &Redactor::default(),
            ErrorCode::AuthError,
            format!("no API key configured for {}", backend),
            default_user_message(ErrorCode::AuthError, backend),
        )
    }

    /// The body ended before the backend's terminal event.
    pub(crate) fn interrupted(redactor: &Redactor, backend: &str) -> Self {
        Self::new(
            redactor,
            ErrorCode::ConnectionError,
            "stream ended before the terminal event",
            format!(
                "The connection to {} was interrupted before the response completed.",
                backend
            ),
        )
    }
}

/// Default display text for a code, naming the backend where useful.
pub fn default_user_message(code: ErrorCode, backend: &str) -> String {
    match code {
        ErrorCode::AuthError => format!(
            "Authentication with {} failed. Please check your API key.",
            backend
        ),
        ErrorCode::RateLimit => format!(
            "{} rate limit reached. Please wait a moment and try again.",
            backend
        ),
        ErrorCode::Overloaded => format!(
            "{} is temporarily overloaded. Please try again shortly.",
            backend
        ),
        ErrorCode::InvalidRequest => format!("{} rejected the request as invalid.", backend),
        ErrorCode::InvalidRole => "The conversation contains an unsupported message role.".into(),
        ErrorCode::InvalidToolResult => {
            "A tool result could not be matched to the tool that produced it.".into()
        }
        ErrorCode::ModelNotFound => format!(
            "The requested model is not available from {}.",
            backend
        ),
        ErrorCode::Timeout => format!("The request to {} timed out.", backend),
        ErrorCode::ConnectionError => format!(
            "Could not connect to {}. Check your network connection.",
            backend
        ),
        ErrorCode::ProviderError => format!("{} returned an unexpected error.", backend),
    }
}

/// Map an HTTP status from a structured-status backend onto the taxonomy.
pub fn classify_status(status: u16) -> ErrorCode {
    match status {
        401 | 403 => ErrorCode::AuthError,
        429 => ErrorCode::RateLimit,
        503 | 529 => ErrorCode::Overloaded,
        404 => ErrorCode::ModelNotFound,
        400 | 413 | 422 => ErrorCode::InvalidRequest,
        408 | 504 => ErrorCode::Timeout,
        _ => ErrorCode::ProviderError,
    }
}

/// Map a `reqwest` transport failure (no HTTP status involved).
pub fn classify_transport(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        ErrorCode::Timeout
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16())
    } else if err.is_decode() {
        ErrorCode::ProviderError
    } else {
        ErrorCode::ConnectionError
    }
}

/// Parse a `Retry-After` header value given in seconds (integer or float).
/// HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

pub(crate) fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}
