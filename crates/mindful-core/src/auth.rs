//! Sign-in state for the app, backed by a GoTrue (Supabase auth) server.
//!
//! Screens never reach for a global client: they are handed an
//! [`AuthProvider`] and ask it whether a user is signed in. [`AuthGate`] is the
//! check that guards authenticated routes such as the call screen.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;

use crate::errors::CallError;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AuthConfig {
    /// Project URL, e.g. `https://<project>.supabase.co`.
    pub auth_url: String,
    /// Public anon key sent as the `apikey` header.
    pub anon_key: String,
    pub http_timeout: Duration,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_url", &self.auth_url)
            .field("anon_key", &"[REDACTED]")
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl AuthConfig {
    pub fn new(auth_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            auth_url: auth_url.into(),
            anon_key: anon_key.into(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_ANON_KEY`.
    pub fn from_env() -> Result<Self, CallError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CallError> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| CallError::InvalidInput(format!("{name} is not set")))
        };
        Ok(Self::new(required("SUPABASE_URL")?, required("SUPABASE_ANON_KEY")?))
    }
}

/// A signed-in user.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= chrono::Utc::now().timestamp()
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn(AuthSession),
    /// The account exists but the email address must be confirmed first.
    ConfirmationPending { email: String },
}

pub trait AuthProvider: Send + Sync {
    /// The current session, or `None` when signed out or expired.
    fn current_session(&self) -> Option<AuthSession>;

    fn is_authenticated(&self) -> bool {
        self.current_session().is_some()
    }

    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<AuthSession, CallError>>;

    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<SignUpOutcome, CallError>>;

    fn sign_out(&self) -> BoxFuture<'_, Result<(), CallError>>;
}

/// Guards screens that need a signed-in user.
#[derive(Clone)]
pub struct AuthGate {
    provider: Arc<dyn AuthProvider>,
}

impl AuthGate {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self { provider }
    }

    pub fn require_authenticated(&self) -> Result<AuthSession, CallError> {
        self.provider
            .current_session()
            .ok_or_else(|| CallError::Auth("not signed in".into()))
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ErrorResponse {
    fn into_message(self) -> Option<String> {
        self.error_description.or(self.msg).or(self.message).or(self.error)
    }
}

impl SessionResponse {
    fn into_session(self) -> AuthSession {
        let expires_at = self.expires_at.unwrap_or_else(|| {
            chrono::Utc::now().timestamp() + self.expires_in.unwrap_or(3600)
        });
        AuthSession {
            user_id: self.user.id,
            email: self.user.email,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

/// Password auth against `{auth_url}/auth/v1`.
pub struct GoTrueAuth {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<AuthSession>>,
}

impl GoTrueAuth {
    pub fn new(config: AuthConfig) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| CallError::Http(format!("building http client: {e}")))?;

        Ok(Self {
            http,
            base_url: format!("{}/auth/v1", config.auth_url.trim_end_matches('/')),
            anon_key: config.anon_key,
            session: RwLock::new(None),
        })
    }

    /// Reinstate a session the host kept from an earlier run.
    pub fn restore_session(&self, session: AuthSession) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    async fn post_credentials(&self, url: &str, email: &str, password: &str) -> Result<reqwest::Response, CallError> {
        let resp = self
            .http
            .post(url)
            .header("apikey", &self.anon_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| CallError::Http(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let message = resp
            .json::<ErrorResponse>()
            .await
            .ok()
            .and_then(ErrorResponse::into_message)
            .unwrap_or_else(|| format!("auth server returned status {status}"));
        tracing::warn!(%status, "auth request rejected: {message}");
        Err(CallError::Auth(message))
    }

    fn store(&self, session: AuthSession) -> AuthSession {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        session
    }

    async fn do_sign_in(&self, email: &str, password: &str) -> Result<AuthSession, CallError> {
        let url = format!("{}/token?grant_type=password", self.base_url);
        let resp = self.post_credentials(&url, email, password).await?;
        let body: SessionResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Auth(format!("invalid sign-in response: {e}")))?;

        let session = self.store(body.into_session());
        tracing::info!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    async fn do_sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, CallError> {
        let url = format!("{}/signup", self.base_url);
        let resp = self.post_credentials(&url, email, password).await?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CallError::Auth(format!("invalid sign-up response: {e}")))?;

        // With email confirmation on, the server answers with the bare user.
        if body.get("access_token").is_none() {
            tracing::info!("sign-up awaiting email confirmation");
            return Ok(SignUpOutcome::ConfirmationPending { email: email.to_string() });
        }

        let body: SessionResponse = serde_json::from_value(body)
            .map_err(|e| CallError::Auth(format!("invalid sign-up response: {e}")))?;
        let session = self.store(body.into_session());
        tracing::info!(user_id = %session.user_id, "signed up");
        Ok(SignUpOutcome::SignedIn(session))
    }

    async fn do_sign_out(&self) -> Result<(), CallError> {
        let session = self.session.write().unwrap_or_else(PoisonError::into_inner).take();
        let Some(session) = session else {
            return Ok(());
        };

        let result = self
            .http
            .post(format!("{}/logout", self.base_url))
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, format!("Bearer {}", session.access_token))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => tracing::info!("signed out"),
            Ok(resp) => tracing::warn!("logout returned status {}, local session cleared", resp.status()),
            Err(e) => tracing::warn!("logout request failed, local session cleared: {e}"),
        }
        Ok(())
    }
}

impl AuthProvider for GoTrueAuth {
    fn current_session(&self) -> Option<AuthSession> {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        session.as_ref().filter(|s| !s.is_expired()).cloned()
    }

    fn sign_in<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<AuthSession, CallError>> {
        Box::pin(self.do_sign_in(email, password))
    }

    fn sign_up<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, Result<SignUpOutcome, CallError>> {
        Box::pin(self.do_sign_up(email, password))
    }

    fn sign_out(&self) -> BoxFuture<'_, Result<(), CallError>> {
        Box::pin(self.do_sign_out())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth(server: &MockServer) -> GoTrueAuth {
        GoTrueAuth::new(AuthConfig::new(server.uri(), "anon-key")).unwrap()
    }

    fn session_body() -> serde_json::Value {
        serde_json::json!({
            "access_token": "access-jwt",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-1",
            "user": { "id": "user-123", "email": "calm@example.com" }
        })
    }

    #[test]
    fn config_debug_redacts_key() {
        let debug = format!("{:?}", AuthConfig::new("https://x.supabase.co", "super-secret-key"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret-key"));
    }

    #[test]
    fn config_reads_supabase_variables() {
        let config = AuthConfig::from_lookup(|key| match key {
            "SUPABASE_URL" => Some("https://calm.supabase.co".into()),
            "SUPABASE_ANON_KEY" => Some("anon".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.auth_url, "https://calm.supabase.co");
        assert_eq!(config.anon_key, "anon");
        assert_eq!(config.http_timeout, DEFAULT_HTTP_TIMEOUT);
    }

    #[test]
    fn config_requires_both_variables() {
        let err = AuthConfig::from_lookup(|key| {
            (key == "SUPABASE_URL").then(|| "https://calm.supabase.co".to_string())
        })
        .unwrap_err();
        assert_eq!(err, CallError::InvalidInput("SUPABASE_ANON_KEY is not set".into()));

        let blank = AuthConfig::from_lookup(|_| Some("  ".into())).unwrap_err();
        assert_eq!(blank, CallError::InvalidInput("SUPABASE_URL is not set".into()));
    }

    #[test]
    fn config_from_process_environment() {
        // No other test in this crate reads these variables.
        unsafe {
            std::env::set_var("SUPABASE_URL", "https://env.supabase.co");
            std::env::set_var("SUPABASE_ANON_KEY", "env-anon");
        }
        let config = AuthConfig::from_env().unwrap();
        unsafe {
            std::env::remove_var("SUPABASE_URL");
            std::env::remove_var("SUPABASE_ANON_KEY");
        }

        assert_eq!(config.auth_url, "https://env.supabase.co");
        assert_eq!(config.anon_key, "env-anon");
    }

    #[tokio::test]
    async fn sign_in_stores_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_json(serde_json::json!({ "email": "calm@example.com", "password": "pw" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth(&server);
        assert!(!auth.is_authenticated());

        let session = auth.sign_in("calm@example.com", "pw").await.unwrap();
        assert_eq!(session.user_id, "user-123");
        assert_eq!(session.email.as_deref(), Some("calm@example.com"));
        assert!(auth.is_authenticated());
        assert_eq!(auth.current_session().unwrap().access_token, "access-jwt");
    }

    #[tokio::test]
    async fn sign_in_surfaces_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&server)
            .await;

        let auth = auth(&server);
        let err = auth.sign_in("calm@example.com", "wrong").await.unwrap_err();
        assert_eq!(err, CallError::Auth("Invalid login credentials".into()));
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn sign_up_without_session_needs_confirmation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "user-9",
                "email": "new@example.com",
                "confirmation_sent_at": "2026-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let auth = auth(&server);
        let outcome = auth.sign_up("new@example.com", "pw").await.unwrap();
        assert_eq!(outcome, SignUpOutcome::ConfirmationPending { email: "new@example.com".into() });
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn sign_up_with_autoconfirm_signs_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .mount(&server)
            .await;

        let auth = auth(&server);
        let outcome = auth.sign_up("calm@example.com", "pw").await.unwrap();
        assert!(matches!(outcome, SignUpOutcome::SignedIn(_)));
        assert!(auth.is_authenticated());
    }

    #[tokio::test]
    async fn sign_out_clears_session_and_revokes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("authorization", "Bearer access-jwt"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let auth = auth(&server);
        auth.sign_in("calm@example.com", "pw").await.unwrap();
        auth.sign_out().await.unwrap();
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn sign_out_clears_locally_even_if_server_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let auth = auth(&server);
        auth.restore_session(AuthSession {
            user_id: "u".into(),
            email: None,
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: chrono::Utc::now().timestamp() + 600,
        });
        assert!(auth.is_authenticated());

        auth.sign_out().await.unwrap();
        assert!(!auth.is_authenticated());
    }

    #[tokio::test]
    async fn expired_session_counts_as_signed_out() {
        let server = MockServer::start().await;
        let auth = auth(&server);
        auth.restore_session(AuthSession {
            user_id: "u".into(),
            email: None,
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: chrono::Utc::now().timestamp() - 1,
        });

        assert!(!auth.is_authenticated());
        let gate = AuthGate::new(Arc::new(auth));
        assert_eq!(gate.require_authenticated().unwrap_err(), CallError::Auth("not signed in".into()));
    }

    #[tokio::test]
    async fn gate_passes_signed_in_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .mount(&server)
            .await;

        let auth = Arc::new(auth(&server));
        auth.sign_in("calm@example.com", "pw").await.unwrap();

        let gate = AuthGate::new(auth);
        assert_eq!(gate.require_authenticated().unwrap().user_id, "user-123");
    }

    #[test]
    fn session_debug_redacts_tokens() {
        let session = AuthSession {
            user_id: "u".into(),
            email: None,
            access_token: "access-secret".into(),
            refresh_token: "refresh-secret".into(),
            expires_at: 0,
        };
        let debug = format!("{session:?}");
        assert!(!debug.contains("access-secret"));
        assert!(!debug.contains("refresh-secret"));
    }
}
