use std::fmt;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::types::now_millis;

/// Machine-readable discriminator carried by every [`ApiError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Rejected before any I/O by the per-URL rate limiter.
    RateLimitExceeded,
    /// The server answered with a status the validation predicate rejected.
    HttpError,
    /// The attempt timed out or was cancelled by the caller.
    Timeout,
    /// The transport failed before a response was received.
    NetworkError,
    /// A custom transport failed in a way it could not classify.
    UnknownError,
    /// An error interceptor replaced the error with a plain value.
    InterceptedError,
    /// A request body could not be encoded or a response body decoded.
    SerializationError,
}

impl ErrorCode {
    /// Wire spelling, e.g. `RATE_LIMIT_EXCEEDED`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::HttpError => "HTTP_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::InterceptedError => "INTERCEPTED_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
        }
    }

    /// Parses the wire spelling produced by [`ErrorCode::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RATE_LIMIT_EXCEEDED" => Some(Self::RateLimitExceeded),
            "HTTP_ERROR" => Some(Self::HttpError),
            "TIMEOUT" => Some(Self::Timeout),
            "NETWORK_ERROR" => Some(Self::NetworkError),
            "UNKNOWN_ERROR" => Some(Self::UnknownError),
            "INTERCEPTED_ERROR" => Some(Self::InterceptedError),
            "SERIALIZATION_ERROR" => Some(Self::SerializationError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned in place of an [`ApiResponse`](crate::ApiResponse).
#[derive(Clone, Debug, PartialEq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    /// Human-readable description.
    pub message: String,
    /// HTTP status, `0` for network failures, absent when not applicable.
    pub status: Option<u16>,
    pub code: ErrorCode,
    /// Structured context such as the raw response body.
    pub details: Option<JsonValue>,
    /// Creation time in epoch milliseconds.
    pub timestamp: u64,
    /// Id sent as `X-Request-ID` with the failed request.
    pub request_id: Option<String>,
}

impl ApiError {
    /// Creates an error stamped with the current time.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code,
            details: None,
            timestamp: now_millis(),
            request_id: None,
        }
    }

    /// Sets the HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches structured context.
    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub(crate) fn rate_limited(url: &str) -> Self {
        Self::new(
            ErrorCode::RateLimitExceeded,
            format!("rate limit exceeded for {url}"),
        )
        .with_status(429)
    }

    pub(crate) fn http(status: u16, status_text: &str, body: String) -> Self {
        Self::new(ErrorCode::HttpError, format!("HTTP {status}: {status_text}"))
            .with_status(status)
            .with_details(serde_json::json!({ "body": body }))
    }

    pub(crate) fn timeout(reason: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
            .with_status(408)
            .with_details(serde_json::json!({ "reason": reason }))
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializationError, message)
    }

    /// Wraps a plain value returned by an error interceptor.
    ///
    /// `message`, `status` and `code` are lifted from the value when present;
    /// the whole value is kept as `details`.
    pub(crate) fn from_intercepted(value: JsonValue, request_id: Option<String>) -> Self {
        let message = match &value {
            JsonValue::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(JsonValue::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| "request failed".to_owned()),
        };
        let status = value
            .get("status")
            .and_then(JsonValue::as_u64)
            .and_then(|status| u16::try_from(status).ok());
        let code = value
            .get("code")
            .and_then(JsonValue::as_str)
            .and_then(ErrorCode::parse)
            .unwrap_or(ErrorCode::InterceptedError);

        Self {
            message,
            status,
            code,
            details: Some(value),
            timestamp: now_millis(),
            request_id,
        }
    }

    /// Whether another attempt may succeed where this one failed.
    ///
    /// Client errors (`< 500`) and `501 Not Implemented` are final, as is
    /// an `UNKNOWN_ERROR` whose details carry `"retryable": false`.
    pub(crate) fn is_retryable(&self) -> bool {
        match self.code {
            ErrorCode::HttpError => self
                .status
                .is_some_and(|status| status >= 500 && status != 501),
            ErrorCode::UnknownError => self
                .details
                .as_ref()
                .and_then(|details| details.get("retryable"))
                .and_then(JsonValue::as_bool)
                .unwrap_or(true),
            ErrorCode::Timeout | ErrorCode::NetworkError => true,
            ErrorCode::RateLimitExceeded
            | ErrorCode::InterceptedError
            | ErrorCode::SerializationError => false,
        }
    }
}

/// Failure raised by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// Any other failure a custom transport reports.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classifies the failure. Only connection, request and body failures
    /// from `reqwest` are network errors; builder, redirect and decode
    /// failures repeat identically and are marked final.
    pub(crate) fn into_api_error(self) -> ApiError {
        match self {
            Self::Reqwest(err) if err.is_timeout() => {
                ApiError::timeout("timeout", format!("request timed out: {err}"))
            }
            Self::Reqwest(err) if err.is_connect() || err.is_request() || err.is_body() => {
                ApiError::new(ErrorCode::NetworkError, err.to_string()).with_status(0)
            }
            Self::Reqwest(err) => ApiError::new(ErrorCode::UnknownError, err.to_string())
                .with_details(serde_json::json!({ "retryable": false })),
            Self::Other(message) => ApiError::new(ErrorCode::UnknownError, message),
        }
    }
}
