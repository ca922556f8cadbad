//! Call token acquisition against the app backend.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use crate::errors::CallError;

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connection timeout for the HTTP client.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Response body of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// A short-lived access token for one user in one session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_for_session_id: String,
    pub issued_for_user_id: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("issued_for_session_id", &self.issued_for_session_id)
            .field("issued_for_user_id", &self.issued_for_user_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TokenClientConfig {
    /// Base address of the backend, e.g. `http://localhost:8000`.
    pub backend_url: String,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
}

impl TokenClientConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// Anything that can hand out call credentials.
///
/// The controller depends on this rather than on [`TokenClient`] so tests and
/// alternative backends can stand in for the HTTP endpoint.
pub trait CredentialSource: Send + Sync {
    fn acquire<'a>(
        &'a self,
        session_id: &'a str,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Credential, CallError>>;
}

/// Requests call tokens from `POST {backend}/livekit/token/{session}?user_id={user}`.
///
/// Every call is a fresh round trip; nothing is cached or retried.
#[derive(Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    backend_url: String,
}

impl TokenClient {
    pub fn new(config: TokenClientConfig) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CallError::Http(format!("building http client: {e}")))?;

        Ok(Self {
            http,
            backend_url: config.backend_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn token_url(&self, session_id: &str, user_id: &str) -> String {
        format!(
            "{}/livekit/token/{}?user_id={}",
            self.backend_url,
            urlencoding::encode(session_id),
            urlencoding::encode(user_id)
        )
    }

    pub async fn acquire(&self, session_id: &str, user_id: &str) -> Result<Credential, CallError> {
        if session_id.trim().is_empty() {
            return Err(CallError::InvalidInput("session id is empty".into()));
        }

        let url = self.token_url(session_id, user_id);
        tracing::info!(session_id, user_id, "requesting call token");

        let resp = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("token request failed: {e}");
                CallError::token_failure()
            })?;

        if !resp.status().is_success() {
            tracing::warn!("token endpoint returned status {}", resp.status());
            return Err(CallError::token_failure());
        }

        let data: TokenResponse = resp.json().await.map_err(|e| {
            tracing::warn!("invalid token response: {e}");
            CallError::token_failure()
        })?;

        if data.token.is_empty() {
            tracing::warn!("token endpoint returned an empty token");
            return Err(CallError::token_failure());
        }

        tracing::info!(session_id, "call token received");
        Ok(Credential {
            token: data.token,
            issued_for_session_id: session_id.to_string(),
            issued_for_user_id: user_id.to_string(),
        })
    }
}

impl CredentialSource for TokenClient {
    fn acquire<'a>(
        &'a self,
        session_id: &'a str,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Credential, CallError>> {
        Box::pin(TokenClient::acquire(self, session_id, user_id))
    }
}

/// Loading/error/result view of token requests, as a screen renders it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestState {
    pub token: Option<String>,
    pub error: Option<String>,
    pub is_loading: bool,
}

#[derive(Default)]
struct RequesterInner {
    state: TokenRequestState,
    generation: u64,
}

/// Tracks the outcome of token requests for a screen.
///
/// Overlapping requests are allowed; only the most recently issued one may
/// write the observable state. Older responses still reach their own caller.
#[derive(Clone)]
pub struct TokenRequester {
    source: Arc<dyn CredentialSource>,
    inner: Arc<Mutex<RequesterInner>>,
}

impl TokenRequester {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            inner: Arc::new(Mutex::new(RequesterInner::default())),
        }
    }

    pub fn state(&self) -> TokenRequestState {
        self.lock().state.clone()
    }

    pub async fn request(&self, session_id: &str, user_id: &str) -> Result<Credential, CallError> {
        let generation = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.state.is_loading = true;
            inner.state.error = None;
            inner.generation
        };

        let result = self.source.acquire(session_id, user_id).await;

        let mut inner = self.lock();
        if inner.generation != generation {
            tracing::debug!(generation, latest = inner.generation, "discarding superseded token response");
            return result;
        }
        inner.state.is_loading = false;
        match &result {
            Ok(credential) => inner.state.token = Some(credential.token.clone()),
            Err(e) => inner.state.error = Some(e.to_string()),
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequesterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
