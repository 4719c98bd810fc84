use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::{
    interceptor::{ErrorInterceptor, Intercepted, RequestInterceptor},
    ApiError, RequestConfig, Result,
};

/// Key under which [`AuthInterceptor`] looks up the access token by default.
pub const DEFAULT_TOKEN_KEY: &str = "auth_token";

/// External credential store consulted for bearer tokens.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn remove(&self, key: &str);
}

/// Process-local [`CredentialStore`].
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remove(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Supplies the CSRF token attached to non-GET requests.
pub trait CsrfTokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> CsrfTokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Attaches `Authorization: Bearer <token>` and forgets the token on HTTP 401.
#[derive(Clone)]
pub struct AuthInterceptor {
    store: Arc<dyn CredentialStore>,
    key: String,
}

impl AuthInterceptor {
    /// Reads the token stored under [`DEFAULT_TOKEN_KEY`].
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self::with_key(store, DEFAULT_TOKEN_KEY)
    }

    /// Reads the token stored under `key`.
    pub fn with_key(store: Arc<dyn CredentialStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl RequestInterceptor for AuthInterceptor {
    async fn on_request(&self, mut config: RequestConfig) -> Result<RequestConfig> {
        if config.header("authorization").is_none() {
            if let Some(token) = self.store.get(&self.key) {
                config.set_header("Authorization", normalize_bearer_authorization(&token));
            }
        }
        Ok(config)
    }
}

#[async_trait]
impl ErrorInterceptor for AuthInterceptor {
    async fn on_error(&self, error: ApiError) -> Intercepted {
        if error.status == Some(401) {
            #[cfg(feature = "tracing")]
            tracing::debug!(key = %self.key, "clearing credentials after 401");

            self.store.remove(&self.key);
        }
        Intercepted::Error(error)
    }
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}
