use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    auth::{AuthInterceptor, CredentialStore, CsrfTokenProvider},
    cache::ResponseCache,
    executor::Executor,
    interceptor::{ErrorInterceptor, InterceptorChain, RequestInterceptor, ResponseInterceptor},
    metrics::{MetricsSink, NoopMetrics, RequestStatus},
    queue::RequestQueue,
    rate_limit::RateLimiter,
    transport::{ReqwestTransport, Transport},
    types::now_millis,
    ApiError, ApiResponse, BatchRequest, EngineConfig, FilePart, HealthCheck, HealthStatus,
    Method, MultipartForm, RequestConfig, RequestOptions, ResponseBody, Result,
};

/// Timeout applied by [`RequestEngine::health_check`].
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side HTTP request engine.
///
/// Every call passes, in order, through the per-URL rate limiter, the
/// request interceptors, the response cache (GET only), the concurrency
/// queue and the retrying executor. Responses then run through the response
/// interceptors before being cached; failures run through the error
/// interceptors before reaching the caller.
pub struct RequestEngine {
    config: EngineConfig,
    executor: Executor,
    queue: RequestQueue,
    cache: Mutex<ResponseCache<ApiResponse<ResponseBody>>>,
    limiter: Mutex<RateLimiter>,
    interceptors: InterceptorChain,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for RequestEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEngine")
            .field("config", &self.config)
            .field("running", &self.queue.running_count())
            .field("queued", &self.queue.queue_size())
            .field("cached", &self.cache_size())
            .field("interceptors", &self.interceptors.counts())
            .finish()
    }
}

impl Default for RequestEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl RequestEngine {
    /// Creates an engine over the default `reqwest` transport.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            executor: Executor::new(Arc::new(ReqwestTransport::default())),
            queue: RequestQueue::new(config.max_concurrent),
            cache: Mutex::new(ResponseCache::new(config.cache_max_size, config.cache_ttl)),
            limiter: Mutex::new(RateLimiter::new(
                config.rate_limit_max_requests,
                config.rate_limit_window,
            )),
            interceptors: InterceptorChain::default(),
            metrics: Arc::new(NoopMetrics),
            config,
        }
    }

    /// Creates an engine whose relative URLs resolve against `base_url`.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(EngineConfig::default().with_base_url(base_url))
    }

    /// Creates an engine from `REQUEST_ENGINE_*` environment variables.
    ///
    /// See [`EngineConfig::from_env`].
    pub fn from_env() -> std::result::Result<Self, String> {
        EngineConfig::from_env().map(Self::new)
    }

    /// Replaces the network transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.executor.set_transport(transport);
        self
    }

    /// Attaches the provider's token as `X-CSRF-Token` on every non-GET request.
    pub fn with_csrf_provider(mut self, provider: Arc<dyn CsrfTokenProvider>) -> Self {
        self.executor.set_csrf_provider(provider);
        self
    }

    /// Reports request durations and cache hits to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registers an [`AuthInterceptor`] over `store` as both a request and an
    /// error interceptor.
    pub fn with_credential_store(self, store: Arc<dyn CredentialStore>) -> Self {
        let auth = Arc::new(AuthInterceptor::new(store));
        self.interceptors.add_request(auth.clone());
        self.interceptors.add_error(auth);
        self
    }

    /// Engine-wide defaults this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Appends an interceptor run, in registration order, before each request.
    pub fn add_request_interceptor(&self, interceptor: impl RequestInterceptor + 'static) {
        self.interceptors.add_request(Arc::new(interceptor));
    }

    /// Appends an interceptor run on each successful response.
    pub fn add_response_interceptor(&self, interceptor: impl ResponseInterceptor + 'static) {
        self.interceptors.add_response(Arc::new(interceptor));
    }

    /// Appends an interceptor run on each failure before it reaches the caller.
    pub fn add_error_interceptor(&self, interceptor: impl ErrorInterceptor + 'static) {
        self.interceptors.add_error(Arc::new(interceptor));
    }

    /// Runs a request and returns the body as parsed by content type.
    pub async fn request_raw(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<ResponseBody>> {
        self.perform(url, options, Ok).await
    }

    /// Runs a request and decodes the body into `T`.
    ///
    /// A body that does not decode fails with `SERIALIZATION_ERROR` and goes
    /// through the error interceptors like any other failure.
    pub async fn request<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.perform(url, options, |response| response.decode()).await
    }

    /// Sends a GET.
    pub async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.request(url, options.method(Method::Get)).await
    }

    /// Sends `body` as JSON with POST.
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send_with_body(Method::Post, url, body, options).await
    }

    /// Sends `body` as JSON with PUT.
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send_with_body(Method::Put, url, body, options).await
    }

    /// Sends `body` as JSON with PATCH.
    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.send_with_body(Method::Patch, url, body, options).await
    }

    /// Sends a DELETE.
    pub async fn delete<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        self.request(url, options.method(Method::Delete)).await
    }

    /// POSTs `file` as the `file` field of a multipart form, together with
    /// any extra text fields.
    pub async fn upload_file<T, I, K, V>(
        &self,
        url: &str,
        file: FilePart,
        fields: I,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let form = fields
            .into_iter()
            .fold(MultipartForm::new().file("file", file), |form, (name, value)| {
                form.text(name, value)
            });
        self.request(url, options.method(Method::Post).body(form))
            .await
    }

    /// Issues all requests concurrently; each stays subject to the queue and
    /// the rate limiter.
    ///
    /// Failures are reported in place, so the output lines up with the input
    /// and a failed entry never aborts its siblings.
    pub async fn batch<T, I>(&self, requests: I) -> Vec<Result<ApiResponse<T>>>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = BatchRequest>,
    {
        join_all(requests.into_iter().map(|request| async move {
            let BatchRequest { url, options } = request;
            self.request::<T>(&url, options).await
        }))
        .await
    }

    /// Probes `endpoint` with a short, uncached, unretried GET.
    ///
    /// Never fails: any error is reported as [`HealthStatus::Unhealthy`].
    pub async fn health_check(&self, endpoint: &str) -> HealthCheck {
        let started = Instant::now();
        let options = RequestOptions::new()
            .method(Method::Get)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .retries(0)
            .cache(false);

        let status = match self.request_raw(endpoint, options).await {
            Ok(_) => HealthStatus::Healthy,
            Err(_error) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint, error = %_error, "health check failed");
                HealthStatus::Unhealthy
            }
        };

        HealthCheck {
            status,
            response_time: elapsed_ms(started),
            timestamp: now_millis(),
        }
    }

    /// Removes every cached response whose key contains `pattern`.
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache_lock()
            .delete_matching(|key| key.contains(pattern))
    }

    /// Drops every cached response.
    pub fn clear_cache(&self) {
        self.cache_lock().clear();
    }

    /// Number of cached responses.
    pub fn cache_size(&self) -> usize {
        self.cache_lock().size()
    }

    /// Changes the concurrency bound; see [`RequestQueue::set_max_concurrent`].
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        self.queue.set_max_concurrent(max_concurrent);
    }

    /// Requests waiting for a concurrency slot.
    pub fn queue_size(&self) -> usize {
        self.queue.queue_size()
    }

    /// Requests currently executing.
    pub fn running_count(&self) -> usize {
        self.queue.running_count()
    }

    async fn run(&self, config: RequestConfig) -> Result<ApiResponse<ResponseBody>> {
        if !self.limiter_lock().is_allowed(&config.url) {
            #[cfg(feature = "tracing")]
            tracing::warn!(url = %config.url, "rate limit exceeded");
            return Err(ApiError::rate_limited(&config.url));
        }

        let config = self.interceptors.run_request(config).await?;

        let cache_key = config.is_cacheable().then(|| config.cache_key());
        if let Some(key) = &cache_key {
            let hit = self.cache_lock().get(key);
            if let Some(response) = hit {
                #[cfg(feature = "tracing")]
                tracing::trace!(key = %key, "cache hit");
                self.metrics.record_cache_hit(&config.url, 1);
                return Ok(response);
            }
        }

        let response = self.queue.add(|| self.executor.execute(&config)).await?;
        let response = self.interceptors.run_response(response).await?;

        match cache_key {
            Some(key) if (200..300).contains(&response.status) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(
                    key = %key,
                    ttl_ms = config.cache_ttl.as_millis() as u64,
                    "caching response"
                );
                let etag = response.header("etag").map(str::to_owned);
                self.cache_lock()
                    .set(key, response.clone(), Some(config.cache_ttl), etag);
            }
            Some(_) => {}
            None if config.method != Method::Get => {
                self.cache_lock()
                    .delete_matching(|key| is_same_resource(key, &config.url));
            }
            None => {}
        }

        Ok(response)
    }

    /// Shared path of every call: runs the pipeline, applies `finish` to a
    /// successful response, routes any failure through the error
    /// interceptors and records one metric for the whole call.
    async fn perform<T>(
        &self,
        url: &str,
        options: RequestOptions,
        finish: impl FnOnce(ApiResponse<ResponseBody>) -> Result<ApiResponse<T>>,
    ) -> Result<ApiResponse<T>> {
        let request_id = Uuid::new_v4().to_string();
        let config = RequestConfig::resolve(url, &self.config, options, request_id.clone());
        let metric_name = format!("{} {}", config.method, config.url);
        let started = Instant::now();

        let result = match self.run(config).await.and_then(finish) {
            Ok(response) => Ok(response),
            Err(mut error) => {
                error.request_id.get_or_insert(request_id);
                Err(self.interceptors.run_error(error).await)
            }
        };

        let status = if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Failure
        };
        self.metrics
            .record_request(&metric_name, elapsed_ms(started), status);
        result
    }

    async fn send_with_body<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>> {
        let body = match serde_json::to_value(body) {
            Ok(body) => body,
            Err(err) => {
                let error = ApiError::serialization(format!("request body encode failed: {err}"));
                return Err(self.interceptors.run_error(error).await);
            }
        };
        self.request(url, options.method(method).body(body)).await
    }

    fn cache_lock(&self) -> MutexGuard<'_, ResponseCache<ApiResponse<ResponseBody>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter_lock(&self) -> MutexGuard<'_, RateLimiter> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether cache `key` belongs to `url`: the URL itself, its query or
/// fragment variants, or a path below it.
fn is_same_resource(key: &str, url: &str) -> bool {
    key.strip_prefix(url)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(&['?', '#', '/'][..]))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
