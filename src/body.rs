use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::ApiError;

/// Response body parsed according to its declared content type.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    /// `application/json` and `+json` media types.
    Json(JsonValue),
    /// `text/*`.
    Text(String),
    /// `application/octet-stream` and `application/pdf`.
    Blob(Vec<u8>),
    /// Any other media type.
    Bytes(Vec<u8>),
    /// Zero-length body.
    Empty,
}

impl ResponseBody {
    pub(crate) fn parse(content_type: Option<&str>, bytes: Vec<u8>) -> Result<Self, ApiError> {
        if bytes.is_empty() {
            return Ok(Self::Empty);
        }

        let media_type = content_type
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();

        if media_type == "application/json" || media_type.ends_with("+json") {
            return serde_json::from_slice(&bytes).map(Self::Json).map_err(|err| {
                ApiError::serialization(format!("invalid JSON response body: {err}"))
            });
        }
        if media_type.starts_with("text/") {
            return Ok(Self::Text(String::from_utf8_lossy(&bytes).into_owned()));
        }
        if media_type == "application/octet-stream" || media_type == "application/pdf" {
            return Ok(Self::Blob(bytes));
        }
        Ok(Self::Bytes(bytes))
    }

    /// The parsed JSON value, if the body was JSON.
    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The text, if the body was `text/*`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The raw bytes of a binary body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(bytes) | Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Decodes into a caller type.
    ///
    /// Text decodes as a JSON string, binary bodies as a byte array and an
    /// empty body as `null`, so `String`, `Vec<u8>` and `Option<_>` work as
    /// targets alongside any JSON-shaped type.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let value = match self {
            Self::Json(value) => value,
            Self::Text(text) => JsonValue::String(text),
            Self::Blob(bytes) | Self::Bytes(bytes) => {
                JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect())
            }
            Self::Empty => JsonValue::Null,
        };
        serde_json::from_value(value)
            .map_err(|err| ApiError::serialization(format!("response body decode failed: {err}")))
    }
}
