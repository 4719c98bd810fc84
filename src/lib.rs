//! `request-engine` is an async client-side HTTP request layer.
//!
//! A [`RequestEngine`] sits between application code and a remote HTTP API
//! and adds, without touching call sites:
//! - bounded concurrency ([`RequestQueue`])
//! - time-boxed caching of GET responses ([`ResponseCache`])
//! - retry with exponential backoff for transient failures
//! - a fixed-window per-URL rate limit ([`RateLimiter`])
//! - request, response and error interceptors
//!
//! Convenience verbs ([`RequestEngine::get`], [`RequestEngine::post`], ...),
//! file upload, batching and a health probe are built on
//! [`RequestEngine::request`].

mod auth;
mod body;
mod cache;
mod engine;
mod error;
mod executor;
mod global;
mod interceptor;
mod metrics;
mod options;
mod queue;
mod rate_limit;
mod request;
mod transport;
mod types;

pub use auth::{
    AuthInterceptor, CredentialStore, CsrfTokenProvider, MemoryCredentialStore, DEFAULT_TOKEN_KEY,
};
pub use body::ResponseBody;
pub use cache::{CacheEntry, ResponseCache};
pub use engine::{RequestEngine, HEALTH_CHECK_TIMEOUT};
pub use error::{ApiError, ErrorCode, TransportError};
pub use executor::{CSRF_HEADER, REQUEST_ID_HEADER};
pub use global::{default_engine, reset_default_engine, set_default_engine};
pub use interceptor::{
    ErrorInterceptor, InterceptorChain, Intercepted, RequestInterceptor, ResponseInterceptor,
};
pub use metrics::{MetricsSink, NoopMetrics, RequestStatus};
pub use options::EngineConfig;
pub use queue::RequestQueue;
pub use rate_limit::RateLimiter;
pub use request::{
    BatchRequest, FilePart, FormField, Method, MultipartForm, ProgressCallback, RequestBody,
    RequestConfig, RequestOptions, StatusValidator,
};
pub use transport::{
    ReqwestTransport, Transport, TransportBody, TransportRequest, TransportResponse,
};
pub use types::{ApiResponse, HealthCheck, HealthStatus};

/// Re-exported so callers can build cancellation tokens without a direct dependency.
pub use tokio_util::sync::CancellationToken;

/// Result of every engine operation.
pub type Result<T> = std::result::Result<T, ApiError>;
