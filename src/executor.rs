use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::CsrfTokenProvider,
    request::{remove_header, set_header},
    transport::{Transport, TransportBody, TransportRequest},
    types::now_millis,
    ApiError, ApiResponse, Method, RequestBody, RequestConfig, ResponseBody, Result,
    TransportError,
};

/// Header carrying the per-call request id.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
/// Header carrying the CSRF token on non-GET requests.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Runs one logical request: builds the wire request once, then attempts
/// it until it succeeds, fails with a final error, or the retry budget is
/// spent.
#[derive(Clone)]
pub(crate) struct Executor {
    transport: Arc<dyn Transport>,
    csrf: Option<Arc<dyn CsrfTokenProvider>>,
}

impl Executor {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            csrf: None,
        }
    }

    pub(crate) fn set_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transport = transport;
    }

    pub(crate) fn set_csrf_provider(&mut self, provider: Arc<dyn CsrfTokenProvider>) {
        self.csrf = Some(provider);
    }

    pub(crate) async fn execute(
        &self,
        config: &RequestConfig,
    ) -> Result<ApiResponse<ResponseBody>> {
        let request = self.build(config)?;
        let mut attempt = 0u32;

        loop {
            let error = match self.attempt(config, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            if is_cancelled(config.cancel.as_ref())
                || !error.is_retryable()
                || attempt >= config.retries
            {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    url = %config.url,
                    attempts = attempt + 1,
                    code = %error.code,
                    "request failed"
                );
                return Err(error);
            }

            self.wait_before_retry(config, attempt).await?;
            attempt += 1;
        }
    }

    fn build(&self, config: &RequestConfig) -> Result<TransportRequest> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_owned(), "application/json".to_owned());
        for (name, value) in &config.headers {
            set_header(&mut headers, name, value.clone());
        }
        set_header(&mut headers, REQUEST_ID_HEADER, config.request_id.clone());

        if config.method != Method::Get {
            if let Some(token) = self.csrf.as_ref().and_then(|provider| provider.token()) {
                set_header(&mut headers, CSRF_HEADER, token);
            }
        }

        let body = match &config.body {
            None => None,
            Some(RequestBody::Json(value)) => {
                let bytes = serde_json::to_vec(value).map_err(|err| {
                    ApiError::serialization(format!("request body encode failed: {err}"))
                })?;
                Some(TransportBody::Bytes(bytes))
            }
            Some(RequestBody::Multipart(form)) => {
                remove_header(&mut headers, "content-type");
                Some(TransportBody::Multipart(form.clone()))
            }
        };

        Ok(TransportRequest {
            url: config.url.clone(),
            method: config.method,
            headers,
            body,
            on_download_progress: config.on_download_progress.clone(),
        })
    }

    /// Exactly one network attempt, raced against the timeout and the
    /// caller's cancellation. The losing futures are dropped on return.
    async fn attempt(
        &self,
        config: &RequestConfig,
        request: TransportRequest,
    ) -> Result<ApiResponse<ResponseBody>> {
        let upload_len = request.body.as_ref().map(TransportBody::len);

        let outcome = tokio::select! {
            biased;
            _ = cancelled(config.cancel.as_ref()) => {
                return Err(ApiError::timeout("cancelled", "request cancelled"));
            }
            _ = sleep(config.timeout) => {
                return Err(ApiError::timeout(
                    "timeout",
                    format!("request timed out after {} ms", config.timeout.as_millis()),
                ));
            }
            outcome = self.transport.send(request) => outcome,
        };
        let response = outcome.map_err(TransportError::into_api_error)?;

        if let (Some(progress), Some(len)) = (&config.on_upload_progress, upload_len) {
            progress(len, Some(len));
        }

        if !(config.validate_status)(response.status) {
            return Err(ApiError::http(
                response.status,
                &response.status_text,
                String::from_utf8_lossy(&response.body).into_owned(),
            ));
        }

        let content_type = response.header("content-type").map(str::to_owned);
        let data = ResponseBody::parse(content_type.as_deref(), response.body)?;
        Ok(ApiResponse {
            data,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            timestamp: now_millis(),
        })
    }

    /// Sleeps `retry_delay * 2^attempt`, waking early if the caller cancels.
    async fn wait_before_retry(&self, config: &RequestConfig, attempt: u32) -> Result<()> {
        let delay = backoff_delay(config.retry_delay, attempt);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            url = %config.url,
            attempt = attempt + 1,
            "retrying request after {} ms",
            delay.as_millis()
        );

        tokio::select! {
            biased;
            _ = cancelled(config.cancel.as_ref()) => {
                Err(ApiError::timeout("cancelled", "request cancelled"))
            }
            _ = sleep(delay) => Ok(()),
        }
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 1u32 << attempt.min(16);
    base.saturating_mul(multiplier)
}

fn is_cancelled(token: Option<&CancellationToken>) -> bool {
    token.is_some_and(CancellationToken::is_cancelled)
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{backoff_delay, Executor, CSRF_HEADER, REQUEST_ID_HEADER};
    use crate::{
        transport::{Transport, TransportBody, TransportRequest, TransportResponse},
        EngineConfig, ErrorCode, FilePart, Method, MultipartForm, RequestConfig, RequestOptions,
        ResponseBody, TransportError,
    };

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        seen: Mutex<Vec<(Instant, TransportRequest)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<(Instant, TransportRequest)> {
            self.seen.lock().expect("seen mutex").clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen
                .lock()
                .expect("seen mutex")
                .push((Instant::now(), request));
            let next = self.responses.lock().expect("responses mutex").pop_front();
            match next {
                Some(response) => response,
                None => std::future::pending().await,
            }
        }
    }

    fn status(code: u16) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: code,
            status_text: format!("status {code}"),
            headers: [("content-type".to_owned(), "application/json".to_owned())].into(),
            body: br#"{"ok":true}"#.to_vec(),
        })
    }

    fn config(options: RequestOptions) -> RequestConfig {
        RequestConfig::resolve(
            "https://api.example.com/comments",
            &EngineConfig::default(),
            options,
            "req-1".to_owned(),
        )
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_with_exponential_backoff() {
        let transport =
            ScriptedTransport::new(vec![status(500), status(500), status(500), status(201)]);
        let executor = Executor::new(transport.clone());

        let response = executor
            .execute(&config(
                RequestOptions::new()
                    .method(Method::Post)
                    .retries(3)
                    .retry_delay(Duration::from_millis(100)),
            ))
            .await
            .expect("request must succeed after retries");
        assert_eq!(response.status, 201);

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 4);
        let expected = [100, 200, 400];
        for (pair, expected_ms) in attempts.windows(2).zip(expected) {
            let gap = pair[1].0 - pair[0].0;
            let expected = Duration::from_millis(expected_ms);
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(5),
                "expected a {expected:?} backoff, got {gap:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![status(404), status(200)]);
        let executor = Executor::new(transport.clone());

        let err = executor
            .execute(&config(RequestOptions::new().retries(3)))
            .await
            .expect_err("404 must fail");
        assert_eq!(err.code, ErrorCode::HttpError);
        assert_eq!(err.status, Some(404));
        assert_eq!(err.details, Some(json!({"body": r#"{"ok":true}"#})));
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        let transport = ScriptedTransport::new(vec![status(502), status(503)]);
        let executor = Executor::new(transport.clone());

        let err = executor
            .execute(&config(RequestOptions::new().retries(1)))
            .await
            .expect_err("retries must run out");
        assert_eq!(err.status, Some(503));
        assert_eq!(transport.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_reported() {
        let transport = ScriptedTransport::new(Vec::new());
        let executor = Executor::new(transport.clone());

        let err = executor
            .execute(&config(
                RequestOptions::new()
                    .timeout(Duration::from_millis(50))
                    .retries(2)
                    .retry_delay(Duration::from_millis(10)),
            ))
            .await
            .expect_err("request must time out");
        assert_eq!(err.code, ErrorCode::Timeout);
        assert_eq!(err.status, Some(408));
        assert_eq!(err.details, Some(json!({"reason": "timeout"})));
        assert_eq!(transport.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_requests_are_never_retried() {
        let transport = ScriptedTransport::new(Vec::new());
        let executor = Executor::new(transport.clone());
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel();
            })
        };

        let err = executor
            .execute(&config(
                RequestOptions::new()
                    .timeout(Duration::from_secs(10))
                    .retries(5)
                    .cancel_token(token),
            ))
            .await
            .expect_err("request must be cancelled");
        canceller.await.expect("canceller must finish");

        assert_eq!(err.code, ErrorCode::Timeout);
        assert_eq!(err.details, Some(json!({"reason": "cancelled"})));
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test]
    async fn custom_transport_failures_are_unknown_errors() {
        let transport =
            ScriptedTransport::new(vec![Err(TransportError::Other("socket gone".to_owned()))]);
        let executor = Executor::new(transport);

        let err = executor
            .execute(&config(RequestOptions::new().retries(0)))
            .await
            .expect_err("transport failure must surface");
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert_eq!(err.message, "socket gone");
    }

    #[tokio::test]
    async fn builds_headers_and_json_body() {
        let transport = ScriptedTransport::new(vec![status(201)]);
        let mut executor = Executor::new(transport.clone());
        executor.set_csrf_provider(Arc::new(|| Some("csrf-123".to_owned())));

        executor
            .execute(&config(
                RequestOptions::new()
                    .method(Method::Post)
                    .body(json!({"text": "hi"}))
                    .header("X-Custom", "1"),
            ))
            .await
            .expect("post must succeed");

        let (_, request) = transport.attempts().remove(0);
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header(REQUEST_ID_HEADER), Some("req-1"));
        assert_eq!(request.header(CSRF_HEADER), Some("csrf-123"));
        assert_eq!(request.header("x-custom"), Some("1"));
        assert_eq!(
            request.body,
            Some(TransportBody::Bytes(br#"{"text":"hi"}"#.to_vec()))
        );
    }

    #[tokio::test]
    async fn get_requests_carry_no_csrf_token() {
        let transport = ScriptedTransport::new(vec![status(200)]);
        let mut executor = Executor::new(transport.clone());
        executor.set_csrf_provider(Arc::new(|| Some("csrf-123".to_owned())));

        let response = executor
            .execute(&config(RequestOptions::new()))
            .await
            .expect("get must succeed");
        assert_eq!(response.data, ResponseBody::Json(json!({"ok": true})));

        let (_, request) = transport.attempts().remove(0);
        assert_eq!(request.header(CSRF_HEADER), None);
        assert_eq!(request.body, None);
    }

    #[tokio::test]
    async fn multipart_body_drops_default_content_type() {
        let transport = ScriptedTransport::new(vec![status(201)]);
        let executor = Executor::new(transport.clone());
        let form = MultipartForm::new().file("file", FilePart::new("a.txt", b"abc".to_vec()));

        executor
            .execute(&config(
                RequestOptions::new()
                    .method(Method::Post)
                    .body(form.clone()),
            ))
            .await
            .expect("upload must succeed");

        let (_, request) = transport.attempts().remove(0);
        assert_eq!(request.header("content-type"), None);
        assert_eq!(request.body, Some(TransportBody::Multipart(form)));
    }

    #[tokio::test]
    async fn custom_status_validation_and_upload_progress() {
        let transport = ScriptedTransport::new(vec![status(304)]);
        let executor = Executor::new(transport);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);

        let response = executor
            .execute(&config(
                RequestOptions::new()
                    .method(Method::Put)
                    .body(json!([1]))
                    .validate_status(|status| status < 400)
                    .on_upload_progress(move |sent, total| {
                        sink.lock().expect("progress mutex").push((sent, total));
                    }),
            ))
            .await
            .expect("304 must pass the custom validator");
        assert_eq!(response.status, 304);
        assert_eq!(*reported.lock().expect("progress mutex"), vec![(3, Some(3))]);
    }
}
