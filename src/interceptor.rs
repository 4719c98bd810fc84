use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{ApiError, ApiResponse, RequestConfig, ResponseBody, Result};

/// Transforms a request before it is sent.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_request(&self, config: RequestConfig) -> Result<RequestConfig>;
}

/// Transforms a successful response before it is cached and returned.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn on_response(
        &self,
        response: ApiResponse<ResponseBody>,
    ) -> Result<ApiResponse<ResponseBody>>;
}

/// What an error interceptor hands to the next one.
#[derive(Clone, Debug, PartialEq)]
pub enum Intercepted {
    /// A proper error, passed on as is.
    Error(ApiError),
    /// A plain value, wrapped into an [`ApiError`] by the engine.
    Value(JsonValue),
}

impl From<ApiError> for Intercepted {
    fn from(error: ApiError) -> Self {
        Self::Error(error)
    }
}

/// Observes or replaces an error. Interceptors cannot suppress a failure.
#[async_trait]
pub trait ErrorInterceptor: Send + Sync {
    async fn on_error(&self, error: ApiError) -> Intercepted;
}

#[async_trait]
impl<F> RequestInterceptor for F
where
    F: Fn(RequestConfig) -> Result<RequestConfig> + Send + Sync,
{
    async fn on_request(&self, config: RequestConfig) -> Result<RequestConfig> {
        self(config)
    }
}

#[async_trait]
impl<F> ResponseInterceptor for F
where
    F: Fn(ApiResponse<ResponseBody>) -> Result<ApiResponse<ResponseBody>> + Send + Sync,
{
    async fn on_response(
        &self,
        response: ApiResponse<ResponseBody>,
    ) -> Result<ApiResponse<ResponseBody>> {
        self(response)
    }
}

#[async_trait]
impl<F> ErrorInterceptor for F
where
    F: Fn(ApiError) -> Intercepted + Send + Sync,
{
    async fn on_error(&self, error: ApiError) -> Intercepted {
        self(error)
    }
}

/// Three ordered interceptor lists. Every registered interceptor runs, in
/// registration order; there is no short-circuiting.
#[derive(Default)]
pub struct InterceptorChain {
    request: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    response: RwLock<Vec<Arc<dyn ResponseInterceptor>>>,
    error: RwLock<Vec<Arc<dyn ErrorInterceptor>>>,
}

impl InterceptorChain {
    /// Appends a request interceptor.
    pub fn add_request(&self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Appends a response interceptor.
    pub fn add_response(&self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.response
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Appends an error interceptor.
    pub fn add_error(&self, interceptor: Arc<dyn ErrorInterceptor>) {
        self.error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Registered (request, response, error) interceptor counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            snapshot(&self.request).len(),
            snapshot(&self.response).len(),
            snapshot(&self.error).len(),
        )
    }

    pub(crate) async fn run_request(&self, mut config: RequestConfig) -> Result<RequestConfig> {
        for interceptor in snapshot(&self.request) {
            config = interceptor.on_request(config).await?;
        }
        Ok(config)
    }

    pub(crate) async fn run_response(
        &self,
        mut response: ApiResponse<ResponseBody>,
    ) -> Result<ApiResponse<ResponseBody>> {
        for interceptor in snapshot(&self.response) {
            response = interceptor.on_response(response).await?;
        }
        Ok(response)
    }

    pub(crate) async fn run_error(&self, mut error: ApiError) -> ApiError {
        for interceptor in snapshot(&self.error) {
            let request_id = error.request_id.clone();
            error = match interceptor.on_error(error).await {
                Intercepted::Error(replacement) => replacement,
                Intercepted::Value(value) => ApiError::from_intercepted(value, request_id),
            };
        }
        error
    }
}

fn snapshot<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.read().unwrap_or_else(PoisonError::into_inner).clone()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;

    use super::{InterceptorChain, Intercepted};
    use crate::{
        ApiError, ApiResponse, EngineConfig, ErrorCode, RequestConfig, RequestOptions,
        ResponseBody, Result,
    };

    fn config() -> RequestConfig {
        RequestConfig::resolve(
            "/videos",
            &EngineConfig::default(),
            RequestOptions::new(),
            "req-1".to_owned(),
        )
    }

    #[tokio::test]
    async fn request_interceptors_run_in_registration_order() {
        let chain = InterceptorChain::default();
        chain.add_request(Arc::new(|mut config: RequestConfig| -> Result<RequestConfig> {
            config.set_header("X-Trace", "a");
            Ok(config)
        }));
        chain.add_request(Arc::new(|mut config: RequestConfig| -> Result<RequestConfig> {
            let previous = config.header("x-trace").unwrap_or_default().to_owned();
            config.set_header("X-Trace", format!("{previous}b"));
            Ok(config)
        }));

        let config = chain.run_request(config()).await.expect("chain must succeed");
        assert_eq!(config.header("X-Trace"), Some("ab"));
    }

    #[tokio::test]
    async fn response_interceptors_transform_in_order() {
        let chain = InterceptorChain::default();
        chain.add_response(Arc::new(
            |response: ApiResponse<ResponseBody>| -> Result<ApiResponse<ResponseBody>> {
                Ok(response.map(|_| ResponseBody::Json(json!({"wrapped": true}))))
            },
        ));

        let response = ApiResponse {
            data: ResponseBody::Empty,
            status: 204,
            status_text: "No Content".to_owned(),
            headers: BTreeMap::new(),
            timestamp: 0,
        };
        let response = chain
            .run_response(response)
            .await
            .expect("chain must succeed");
        assert_eq!(response.data, ResponseBody::Json(json!({"wrapped": true})));
    }

    #[tokio::test]
    async fn plain_values_from_error_interceptors_are_wrapped() {
        let chain = InterceptorChain::default();
        chain.add_error(Arc::new(|error: ApiError| {
            Intercepted::Value(json!({"message": format!("wrapped: {}", error.message)}))
        }));
        chain.add_error(Arc::new(|mut error: ApiError| {
            error.message.push_str(" (seen)");
            Intercepted::Error(error)
        }));

        let original = ApiError::http(404, "Not Found", String::new()).with_request_id("req-9");
        let error = chain.run_error(original).await;

        assert_eq!(error.code, ErrorCode::InterceptedError);
        assert_eq!(error.message, "wrapped: HTTP 404: Not Found (seen)");
        assert_eq!(error.request_id.as_deref(), Some("req-9"));
    }

    #[test]
    fn counts_each_list() {
        let chain = InterceptorChain::default();
        chain.add_error(Arc::new(|error: ApiError| Intercepted::from(error)));
        assert_eq!(chain.counts(), (0, 0, 1));
    }
}
