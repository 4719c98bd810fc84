use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::request::{set_header, RedactedHeaders};

/// Engine-wide defaults merged under every call's [`RequestOptions`](crate::RequestOptions).
#[derive(Clone, Eq, PartialEq)]
pub struct EngineConfig {
    /// Prefix for relative URLs. Empty leaves URLs untouched.
    pub base_url: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Maximum number of retries after the initial attempt.
    pub retries: u32,
    /// Base retry delay (exponential strategy).
    pub retry_delay: Duration,
    /// Whether GET responses are cached unless a call says otherwise.
    pub cache: bool,
    /// Lifetime of cached responses unless a call overrides it.
    pub cache_ttl: Duration,
    /// Cached responses kept before the oldest is evicted.
    pub cache_max_size: usize,
    /// Bound on concurrently executing requests.
    pub max_concurrent: usize,
    /// Requests admitted per URL within one rate-limit window.
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    /// Headers sent with every request; call-site headers win.
    pub default_headers: BTreeMap<String, String>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("retry_delay", &self.retry_delay)
            .field("cache", &self.cache)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_max_size", &self.cache_max_size)
            .field("max_concurrent", &self.max_concurrent)
            .field("rate_limit_max_requests", &self.rate_limit_max_requests)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("default_headers", &RedactedHeaders(&self.default_headers))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            cache: false,
            cache_ttl: Duration::from_secs(5 * 60),
            cache_max_size: 100,
            max_concurrent: 6,
            rate_limit_max_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            default_headers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Sets the prefix for relative URLs.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Adds a header sent with every request.
    pub fn with_default_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        set_header(&mut self.default_headers, name.as_ref(), value.into());
        self
    }

    /// Admits `max_requests` per URL in each `window`.
    pub fn with_rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_limit_max_requests = max_requests;
        self.rate_limit_window = window;
        self
    }

    /// Builds a configuration from environment variables.
    ///
    /// Reads:
    /// - `REQUEST_ENGINE_BASE_URL`: required base URL
    /// - `REQUEST_ENGINE_TIMEOUT_MS`: optional per-attempt timeout
    /// - `REQUEST_ENGINE_RETRIES`: optional retry count
    /// - `REQUEST_ENGINE_MAX_CONCURRENT`: optional concurrency bound
    ///
    /// Returns an error if the base URL is missing or empty, or if an
    /// optional variable is set but not a valid number.
    pub fn from_env() -> std::result::Result<Self, String> {
        let base_url = std::env::var("REQUEST_ENGINE_BASE_URL")
            .map_err(|_| "missing REQUEST_ENGINE_BASE_URL environment variable".to_owned())?;
        if base_url.trim().is_empty() {
            return Err("REQUEST_ENGINE_BASE_URL is set but empty".to_owned());
        }

        let mut config = Self::default().with_base_url(base_url.trim());
        if let Some(timeout_ms) = env_number::<u64>("REQUEST_ENGINE_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(retries) = env_number("REQUEST_ENGINE_RETRIES")? {
            config.retries = retries;
        }
        if let Some(max_concurrent) = env_number("REQUEST_ENGINE_MAX_CONCURRENT")? {
            config.max_concurrent = max_concurrent;
        }
        Ok(config)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> std::result::Result<Option<T>, String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name} must be a non-negative integer, got '{raw}'")),
        Err(_) => Ok(None),
    }
}
