use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;

use crate::{ApiError, ResponseBody};

/// Successful response of one logical request.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: u16,
    pub status_text: String,
    /// Response headers with lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Receipt time in epoch milliseconds.
    pub timestamp: u64,
}

impl<T> ApiResponse<T> {
    /// Looks a response header up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Transforms the payload, keeping status and headers.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            data: f(self.data),
            status: self.status,
            status_text: self.status_text,
            headers: self.headers,
            timestamp: self.timestamp,
        }
    }
}

impl ApiResponse<ResponseBody> {
    /// Decodes the body into `T`, keeping status and headers.
    pub fn decode<T: DeserializeOwned>(self) -> Result<ApiResponse<T>, ApiError> {
        let ApiResponse {
            data,
            status,
            status_text,
            headers,
            timestamp,
        } = self;
        Ok(ApiResponse {
            data: data.decode()?,
            status,
            status_text,
            headers,
            timestamp,
        })
    }
}

/// Outcome of [`RequestEngine::health_check`](crate::RequestEngine::health_check).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthCheck {
    pub status: HealthStatus,
    /// Round-trip time in milliseconds.
    pub response_time: u64,
    pub timestamp: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
