use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::EngineConfig;

/// Decides whether a response status counts as success.
pub type StatusValidator = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Receives `(transferred_bytes, total_bytes_if_known)`.
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// HTTP method of a request. Defaults to GET.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file attached to a multipart form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePart {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FilePart {
    /// A file part with no explicit content type.
    pub fn new(file_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    /// Sets the part's `Content-Type`; it must parse as a MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Value of one multipart field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormField {
    Text(String),
    File(FilePart),
}

/// Multipart form that can be rebuilt for every attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultipartForm {
    pub fields: Vec<(String, FormField)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .push((name.into(), FormField::Text(value.into())));
        self
    }

    /// Appends a file field.
    pub fn file(mut self, name: impl Into<String>, file: FilePart) -> Self {
        self.fields.push((name.into(), FormField::File(file)));
        self
    }

    pub(crate) fn byte_len(&self) -> u64 {
        self.fields
            .iter()
            .map(|(_, field)| match field {
                FormField::Text(text) => text.len() as u64,
                FormField::File(file) => file.data.len() as u64,
            })
            .sum()
    }
}

/// Body of an outgoing request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    /// Encoded as JSON.
    Json(JsonValue),
    /// Passed through untouched; the transport sets the boundary.
    Multipart(MultipartForm),
}

impl From<JsonValue> for RequestBody {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl From<MultipartForm> for RequestBody {
    fn from(form: MultipartForm) -> Self {
        Self::Multipart(form)
    }
}

/// Call-site overrides; unset fields fall back to the engine defaults.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Defaults to GET.
    pub method: Option<Method>,
    /// Merged over the engine's default headers.
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub cache: Option<bool>,
    pub cache_ttl: Option<Duration>,
    /// Replaces the default `200..300` success check.
    pub validate_status: Option<StatusValidator>,
    pub on_upload_progress: Option<ProgressCallback>,
    pub on_download_progress: Option<ProgressCallback>,
    /// Cancels the in-flight attempt and any pending retry backoff.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Adds a header; names compare case-insensitively.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, &name.into(), value.into());
        self
    }

    /// Sets a JSON or multipart body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how many retries follow a retryable failure.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Sets the base backoff delay.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Enables or disables caching for this GET.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = Some(enabled);
        self
    }

    /// Sets how long a cached response stays fresh.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Decides which statuses count as success.
    pub fn validate_status(mut self, f: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.validate_status = Some(Arc::new(f));
        self
    }

    /// Called with `(sent, total)` once the body is handed off.
    pub fn on_upload_progress(
        mut self,
        f: impl Fn(u64, Option<u64>) + Send + Sync + 'static,
    ) -> Self {
        self.on_upload_progress = Some(Arc::new(f));
        self
    }

    /// Called with `(received, total)` per received chunk.
    pub fn on_download_progress(
        mut self,
        f: impl Fn(u64, Option<u64>) + Send + Sync + 'static,
    ) -> Self {
        self.on_download_progress = Some(Arc::new(f));
        self
    }

    /// Attaches a cancellation token.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("headers", &RedactedHeaders(&self.headers))
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("cache", &self.cache)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

/// Fully resolved configuration of one logical request.
///
/// This is what request interceptors see and transform.
#[derive(Clone)]
pub struct RequestConfig {
    /// Absolute URL after base-URL resolution.
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub cache: bool,
    pub cache_ttl: Duration,
    pub validate_status: StatusValidator,
    pub on_upload_progress: Option<ProgressCallback>,
    pub on_download_progress: Option<ProgressCallback>,
    pub cancel: Option<CancellationToken>,
    /// Sent as `X-Request-ID`.
    pub request_id: String,
}

impl RequestConfig {
    pub(crate) fn resolve(
        url: &str,
        defaults: &EngineConfig,
        options: RequestOptions,
        request_id: String,
    ) -> Self {
        let mut headers = defaults.default_headers.clone();
        for (name, value) in options.headers {
            set_header(&mut headers, &name, value);
        }

        Self {
            url: resolve_url(&defaults.base_url, url),
            method: options.method.unwrap_or_default(),
            headers,
            body: options.body,
            timeout: options.timeout.unwrap_or(defaults.timeout),
            retries: options.retries.unwrap_or(defaults.retries),
            retry_delay: options.retry_delay.unwrap_or(defaults.retry_delay),
            cache: options.cache.unwrap_or(defaults.cache),
            cache_ttl: options.cache_ttl.unwrap_or(defaults.cache_ttl),
            validate_status: options
                .validate_status
                .unwrap_or_else(|| Arc::new(default_validate_status)),
            on_upload_progress: options.on_upload_progress,
            on_download_progress: options.on_download_progress,
            cancel: options.cancel,
            request_id,
        }
    }

    /// Looks a header up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sets a header, replacing any differently cased duplicate.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        set_header(&mut self.headers, name, value.into());
    }

    /// GET with caching enabled.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::Get && self.cache
    }

    /// URL plus a stable rendering of anything else that shapes the result.
    pub(crate) fn cache_key(&self) -> String {
        match &self.body {
            None => self.url.clone(),
            Some(RequestBody::Json(value)) => format!("{}#{value}", self.url),
            Some(RequestBody::Multipart(_)) => format!("{}#multipart", self.url),
        }
    }
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfig")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &RedactedHeaders(&self.headers))
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("cache", &self.cache)
            .field("cache_ttl", &self.cache_ttl)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// One entry of [`RequestEngine::batch`](crate::RequestEngine::batch).
#[derive(Clone, Debug, Default)]
pub struct BatchRequest {
    pub url: String,
    pub options: RequestOptions,
}

impl BatchRequest {
    /// A GET of `url` with default options.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: RequestOptions::default(),
        }
    }

    /// Replaces the options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// Header names whose values never appear in `Debug` output.
const SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    crate::executor::CSRF_HEADER,
];

/// `Debug` view of a header map with credential values masked.
pub(crate) struct RedactedHeaders<'a>(pub(crate) &'a BTreeMap<String, String>);

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(name, value)| {
                let sensitive = SENSITIVE_HEADERS
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(name));
                (name, if sensitive { "<redacted>" } else { value.as_str() })
            }))
            .finish()
    }
}

pub(crate) fn default_validate_status(status: u16) -> bool {
    (200..300).contains(&status)
}

pub(crate) fn resolve_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") || base_url.is_empty() {
        return url.to_owned();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        url.trim_start_matches('/')
    )
}

/// Inserts a header, replacing any existing entry regardless of name case.
pub(crate) fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: String) {
    remove_header(headers, name);
    headers.insert(name.to_owned(), value);
}

pub(crate) fn remove_header(headers: &mut BTreeMap<String, String>, name: &str) {
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{resolve_url, Method, RequestConfig, RequestOptions};
    use crate::EngineConfig;

    #[test]
    fn absolute_urls_pass_through() {
        assert_eq!(
            resolve_url("https://api.example.com", "http://other/x"),
            "http://other/x"
        );
        assert_eq!(
            resolve_url("https://api.example.com/", "/videos/42"),
            "https://api.example.com/videos/42"
        );
        assert_eq!(resolve_url("", "/videos/42"), "/videos/42");
    }

    #[test]
    fn call_site_options_win_over_defaults() {
        let defaults = EngineConfig {
            base_url: "https://api.example.com".to_owned(),
            ..EngineConfig::default()
        }
        .with_default_header("X-Client", "engine")
        .with_default_header("Accept", "application/json");

        let config = RequestConfig::resolve(
            "/videos",
            &defaults,
            RequestOptions::new()
                .method(Method::Post)
                .header("accept", "text/plain")
                .retries(7)
                .timeout(Duration::from_millis(50)),
            "req-1".to_owned(),
        );

        assert_eq!(config.url, "https://api.example.com/videos");
        assert_eq!(config.method, Method::Post);
        assert_eq!(config.retries, 7);
        assert_eq!(config.timeout, Duration::from_millis(50));
        assert_eq!(config.retry_delay, defaults.retry_delay);
        assert_eq!(config.header("Accept"), Some("text/plain"));
        assert_eq!(config.header("x-client"), Some("engine"));
        assert_eq!(config.headers.len(), 2);
        assert!((config.validate_status)(204));
        assert!(!(config.validate_status)(304));
    }

    #[test]
    fn cache_key_includes_body() {
        let defaults = EngineConfig::default();
        let plain = RequestConfig::resolve("/search?q=x", &defaults, RequestOptions::new(), "a".into());
        let with_body = RequestConfig::resolve(
            "/search?q=x",
            &defaults,
            RequestOptions::new().body(json!({"page": 2})),
            "b".into(),
        );
        assert_eq!(plain.cache_key(), "/search?q=x");
        assert_eq!(with_body.cache_key(), r#"/search?q=x#{"page":2}"#);
    }

    #[test]
    fn debug_redacts_credential_headers() {
        let mut config = RequestConfig::resolve(
            "https://api.example.com/me",
            &EngineConfig::default(),
            RequestOptions::new().header("authorization", "Bearer secret-token"),
            "req-1".to_owned(),
        );
        config.set_header("X-CSRF-Token", "csrf-secret");
        config.set_header("Accept", "application/json");

        let debug = format!("{config:?}");
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("application/json"));
        assert!(!debug.contains("secret-token"));
        assert!(!debug.contains("csrf-secret"));
    }
}
