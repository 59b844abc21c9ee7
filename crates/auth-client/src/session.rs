//! Login session lifecycle
//!
//! A `Session` owns the login/logout side of authentication: it exchanges
//! credentials for tokens, writes them to the coordinator's store, and
//! (re)configures the coordinator so that `AuthClient` can refresh them.

use auth_refresh::{DEFAULT_EXPIRY_STATUS, RefreshCoordinator, RefreshSource};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Endpoints and expiry signal for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub login_url: String,
    /// Without a refresh URL, expiry responses fail with `RefreshUnavailable`.
    pub refresh_url: Option<String>,
    pub expiry_status: u16,
}

impl SessionConfig {
    pub fn new(login_url: impl Into<String>) -> Self {
        Self {
            login_url: login_url.into(),
            refresh_url: None,
            expiry_status: DEFAULT_EXPIRY_STATUS,
        }
    }

    pub fn with_refresh_url(mut self, url: impl Into<String>) -> Self {
        self.refresh_url = Some(url.into());
        self
    }

    fn refresh_source(&self) -> Option<RefreshSource> {
        self.refresh_url.clone().map(RefreshSource::Endpoint)
    }
}

/// Snapshot of the session for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub refreshing: bool,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct SessionState {
    login_response: Option<serde_json::Value>,
    last_error: Option<String>,
    loading: bool,
}

pub struct Session {
    config: SessionConfig,
    coordinator: RefreshCoordinator,
    http_client: reqwest::Client,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        coordinator: RefreshCoordinator,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            coordinator,
            http_client,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Resume a session from whatever the store already holds.
    ///
    /// Returns whether an access token was found. The coordinator is
    /// configured either way so expiry responses are classified.
    pub async fn restore(&self) -> Result<bool> {
        let pair = self
            .coordinator
            .credential_store()
            .get()
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        self.coordinator
            .configure(self.config.refresh_source(), self.config.expiry_status)
            .await;
        let authenticated = pair.access.is_some();
        info!(
            authenticated,
            can_refresh = pair.can_refresh(),
            "session restored from credential store"
        );
        Ok(authenticated)
    }

    /// Exchange `credentials` for tokens and start a new session.
    ///
    /// Replaces any previous session's tokens, including its refresh token.
    /// Returns the full login response body.
    pub async fn login(&self, credentials: &serde_json::Value) -> Result<serde_json::Value> {
        self.state.lock().await.loading = true;

        let outcome =
            auth_store::login(&self.http_client, &self.config.login_url, credentials).await;

        let mut state = self.state.lock().await;
        state.loading = false;
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "login failed");
                state.last_error = Some(status_message(&e));
                return Err(Error::Login(e));
            }
        };

        // Detach any in-flight refresh from the store before replacing tokens
        self.coordinator.clear_auth().await;
        let store = self.coordinator.credential_store();
        store.clear().await.map_err(|e| Error::Store(e.to_string()))?;
        store
            .set(response.grant.access_token, response.grant.refresh_token)
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        self.coordinator
            .configure(self.config.refresh_source(), self.config.expiry_status)
            .await;

        info!(
            refresh_available = self.config.refresh_url.is_some(),
            "logged in"
        );
        state.last_error = None;
        state.login_response = Some(response.body.clone());
        Ok(response.body)
    }

    /// End the session: stop refreshing and forget both tokens.
    pub async fn logout(&self) -> Result<()> {
        self.coordinator.clear_auth().await;
        self.coordinator
            .credential_store()
            .clear()
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        let mut state = self.state.lock().await;
        state.login_response = None;
        state.last_error = None;
        info!("logged out");
        Ok(())
    }

    /// Body of the most recent successful login in this process.
    pub async fn login_response(&self) -> Option<serde_json::Value> {
        self.state.lock().await.login_response.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        let authenticated = matches!(
            self.coordinator.credential_store().get().await,
            Ok(pair) if pair.access.is_some()
        );
        let refreshing = self.coordinator.is_refreshing().await;
        let state = self.state.lock().await;
        SessionStatus {
            authenticated,
            refreshing,
            loading: state.loading,
            error: state.last_error.clone(),
        }
    }
}

/// Message reported by `status()` after a failed login: the server's own
/// message when it sent one.
fn status_message(err: &auth_store::Error) -> String {
    match err {
        auth_store::Error::InvalidCredentials(message)
        | auth_store::Error::TokenExchange(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthClient, ClientConfig, ReqwestTransport};
    use auth_store::{CredentialStore, MemoryStore};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use common::Secret;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock auth + API server. `/login` accepts password "hunter2", `/refresh`
    /// rotates tokens, `/api/me` accepts only the most recently issued
    /// access token.
    #[derive(Clone, Default)]
    struct Backend {
        issued: Arc<AtomicUsize>,
        refreshes: Arc<AtomicUsize>,
    }

    impl Backend {
        fn current_token(&self) -> String {
            format!("at_{}", self.issued.load(Ordering::SeqCst))
        }
    }

    async fn login_handler(
        State(backend): State<Backend>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if body["password"] != "hunter2" {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"message": "bad password"})),
            );
        }
        let n = backend.issued.fetch_add(1, Ordering::SeqCst) + 1;
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "access_token": format!("at_{n}"),
                "refresh_token": format!("rt_{n}"),
                "user": {"name": body["username"]},
            })),
        )
    }

    async fn refresh_handler(
        State(backend): State<Backend>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        backend.refreshes.fetch_add(1, Ordering::SeqCst);
        let expected = format!("rt_{}", backend.issued.load(Ordering::SeqCst));
        if body["refresh_token"] != expected.as_str() {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"message": "refresh token revoked"})),
            );
        }
        let n = backend.issued.fetch_add(1, Ordering::SeqCst) + 1;
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "access_token": format!("at_{n}"),
                "refresh_token": format!("rt_{n}"),
            })),
        )
    }

    async fn me_handler(State(backend): State<Backend>, headers: HeaderMap) -> StatusCode {
        let expected = format!("Bearer {}", backend.current_token());
        match headers.get("authorization") {
            Some(v) if v.to_str().unwrap() == expected => StatusCode::OK,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    async fn start_backend() -> (String, Backend) {
        let backend = Backend::default();
        let app = Router::new()
            .route("/login", post(login_handler))
            .route("/refresh", post(refresh_handler))
            .route("/api/me", get(me_handler))
            .with_state(backend.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), backend)
    }

    fn session(base: &str, store: Arc<MemoryStore>) -> Session {
        let http = reqwest::Client::new();
        let coordinator = RefreshCoordinator::new(store, http.clone());
        let config = SessionConfig::new(format!("{base}/login"))
            .with_refresh_url(format!("{base}/refresh"));
        Session::new(config, coordinator, http)
    }

    #[tokio::test]
    async fn login_stores_tokens_and_keeps_response() {
        let (base, _backend) = start_backend().await;
        let store = Arc::new(MemoryStore::new());
        let session = session(&base, store.clone());

        let body = session
            .login(&serde_json::json!({"username": "ada", "password": "hunter2"}))
            .await
            .unwrap();

        assert_eq!(body["user"]["name"], "ada");
        let pair = store.get().await.unwrap();
        assert_eq!(pair.access, Some(Secret::from("at_1")));
        assert_eq!(pair.refresh, Some(Secret::from("rt_1")));
        assert_eq!(session.login_response().await.unwrap(), body);
        let status = session.status().await;
        assert!(status.authenticated);
        assert!(!status.loading);
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn failed_login_records_error_and_leaves_store_alone() {
        let (base, _backend) = start_backend().await;
        let store = Arc::new(MemoryStore::with_tokens(Some("at_old"), Some("rt_old")));
        let session = session(&base, store.clone());

        let err = session
            .login(&serde_json::json!({"username": "ada", "password": "wrong"}))
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::Login(auth_store::Error::InvalidCredentials(ref m)) if m == "bad password"),
            "got: {err:?}"
        );
        assert_eq!(
            store.get().await.unwrap().access,
            Some(Secret::from("at_old"))
        );
        let status = session.status().await;
        assert_eq!(status.error.as_deref(), Some("bad password"));
    }

    #[tokio::test]
    async fn logout_clears_tokens_and_disables_refresh() {
        let (base, backend) = start_backend().await;
        let store = Arc::new(MemoryStore::new());
        let session = session(&base, store.clone());
        session
            .login(&serde_json::json!({"username": "ada", "password": "hunter2"}))
            .await
            .unwrap();

        session.logout().await.unwrap();

        assert!(store.get().await.unwrap().is_empty());
        assert!(session.login_response().await.is_none());
        assert!(!session.status().await.authenticated);

        let client = AuthClient::new(
            Arc::new(ReqwestTransport::new(reqwest::Client::new())),
            session.coordinator().clone(),
            ClientConfig::with_base_url(&base),
        );
        let err = client.get("/api/me").await.unwrap_err();
        assert!(matches!(err, Error::RefreshUnavailable { .. }), "got: {err:?}");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_refreshes_against_real_endpoints() {
        let (base, backend) = start_backend().await;
        let store = Arc::new(MemoryStore::new());
        let session = session(&base, store.clone());
        session
            .login(&serde_json::json!({"username": "ada", "password": "hunter2"}))
            .await
            .unwrap();
        let client = AuthClient::new(
            Arc::new(ReqwestTransport::new(reqwest::Client::new())),
            session.coordinator().clone(),
            ClientConfig::with_base_url(&base),
        );

        assert_eq!(client.get("/api/me").await.unwrap().status, 200);

        // Server-side rotation invalidates at_1 without telling the client
        backend.issued.fetch_add(1, Ordering::SeqCst);
        store.set(Secret::from("at_1"), Some(Secret::from("rt_2"))).await.unwrap();

        let response = client.get("/api/me").await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        let pair = store.get().await.unwrap();
        assert_eq!(pair.access, Some(Secret::from("at_3")));
        assert_eq!(pair.refresh, Some(Secret::from("rt_3")));
    }

    #[tokio::test]
    async fn login_during_previous_users_refresh_gets_own_token() {
        let (base, backend) = start_backend().await;
        let store = Arc::new(MemoryStore::with_tokens(Some("at_userA"), Some("rt_userA")));
        let session = session(&base, store.clone());
        let coordinator = session.coordinator().clone();

        // Previous user's refresh, still running when the next login lands
        coordinator
            .configure(
                Some(RefreshSource::operation(|_refresh: Secret<String>| async {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    Ok::<_, auth_store::Error>(auth_store::TokenGrant::new("at_userA_2", None))
                })),
                401,
            )
            .await;
        let previous = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.acquire().await }
        });
        while !coordinator.is_refreshing().await {
            tokio::task::yield_now().await;
        }

        session
            .login(&serde_json::json!({"username": "bob", "password": "hunter2"}))
            .await
            .unwrap();
        // The new session's access token has already expired upstream
        store.set(Secret::from("at_expired"), None).await.unwrap();

        let client = AuthClient::new(
            Arc::new(ReqwestTransport::new(reqwest::Client::new())),
            coordinator.clone(),
            ClientConfig::with_base_url(&base),
        );
        let response = client.get("/api/me").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(previous.await.unwrap().unwrap().expose(), "at_userA_2");
        let pair = store.get().await.unwrap();
        assert_eq!(pair.access, Some(Secret::from("at_2")));
        assert_eq!(pair.refresh, Some(Secret::from("rt_2")));
    }

    #[tokio::test]
    async fn restore_configures_refresh_from_stored_tokens() {
        let (base, _backend) = start_backend().await;
        let store = Arc::new(MemoryStore::with_tokens(Some("at_9"), Some("rt_9")));
        let session = session(&base, store);

        assert!(session.restore().await.unwrap());
        assert_eq!(
            session.coordinator().classify(401).await,
            auth_refresh::ExpiryClass::Refreshable
        );
    }

    #[tokio::test]
    async fn restore_without_tokens_is_unauthenticated() {
        let (base, _backend) = start_backend().await;
        let session = session(&base, Arc::new(MemoryStore::new()));

        assert!(!session.restore().await.unwrap());
        assert!(!session.status().await.authenticated);
    }

    #[test]
    fn status_omits_absent_error() {
        let status = SessionStatus {
            authenticated: true,
            refreshing: false,
            loading: false,
            error: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"authenticated": true, "refreshing": false, "loading": false})
        );
    }
}
