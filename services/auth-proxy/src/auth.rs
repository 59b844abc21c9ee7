//! Session endpoints
//!
//! - POST /auth/login: exchange credentials for tokens, return the login response
//! - POST /auth/logout: drop tokens and stop refreshing
//! - GET  /auth/status: `{authenticated, refreshing, loading, error?}`
//!
//! Responses never include tokens beyond what the login endpoint itself
//! returned to the caller.

use std::sync::Arc;

use auth_client::{Error as ClientError, Session};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

/// Build the session router. Merged into the main router.
pub fn build_auth_router<S>(session: Arc<Session>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/status", get(status))
        .with_state(session)
}

fn json_error(status: StatusCode, kind: &str, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": { "type": kind, "message": message }
        })),
    )
        .into_response()
}

/// POST /auth/login. The body is forwarded verbatim to the login URL.
async fn login(
    State(session): State<Arc<Session>>,
    Json(credentials): Json<serde_json::Value>,
) -> Response {
    match session.login(&credentials).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(ClientError::Login(auth_store::Error::InvalidCredentials(message))) => {
            json_error(StatusCode::UNAUTHORIZED, "authentication_error", message)
        }
        Err(ClientError::Login(e)) => {
            json_error(StatusCode::BAD_GATEWAY, "login_error", e.to_string())
        }
        Err(e) => {
            warn!(error = %e, "login could not be completed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "session_error", e.to_string())
        }
    }
}

/// POST /auth/logout
async fn logout(State(session): State<Arc<Session>>) -> Response {
    match session.logout().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "logout could not clear credentials");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "session_error", e.to_string())
        }
    }
}

/// GET /auth/status
async fn status(State(session): State<Arc<Session>>) -> Response {
    (StatusCode::OK, Json(session.status().await)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_client::SessionConfig;
    use auth_refresh::RefreshCoordinator;
    use auth_store::{CredentialStore, MemoryStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn start_login_server() -> String {
        let app = Router::new().route(
            "/login",
            post(|Json(body): Json<serde_json::Value>| async move {
                if body["password"] == "hunter2" {
                    (
                        StatusCode::OK,
                        Json(serde_json::json!({
                            "access_token": "at_1",
                            "refresh_token": "rt_1",
                            "user": {"id": 7},
                        })),
                    )
                } else if body["password"] == "crash" {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({"message": "database down"})),
                    )
                } else {
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(serde_json::json!({"message": "invalid username or password"})),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    async fn router() -> (Router, Arc<MemoryStore>) {
        let base = start_login_server().await;
        let store = Arc::new(MemoryStore::new());
        let http = reqwest::Client::new();
        let coordinator = RefreshCoordinator::new(store.clone(), http.clone());
        let session = Session::new(
            SessionConfig::new(format!("{base}/login")).with_refresh_url(format!("{base}/refresh")),
            coordinator,
            http,
        );
        (build_auth_router(Arc::new(session)), store)
    }

    fn login_request(password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"username": "ada", "password": password}).to_string(),
            ))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn login_returns_full_response_and_stores_tokens() {
        let (app, store) = router().await;

        let response = app.oneshot(login_request("hunter2")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["user"]["id"], 7);
        let pair = store.get().await.unwrap();
        assert_eq!(pair.access.unwrap().expose(), "at_1");
        assert_eq!(pair.refresh.unwrap().expose(), "rt_1");
    }

    #[tokio::test]
    async fn rejected_login_is_401_with_server_message() {
        let (app, store) = router().await;

        let response = app.oneshot(login_request("wrong")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = json_body(response).await;
        assert_eq!(json["error"]["type"], "authentication_error");
        assert_eq!(json["error"]["message"], "invalid username or password");
        assert!(store.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn login_server_failure_is_502() {
        let (app, _store) = router().await;

        let response = app.oneshot(login_request("crash")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = json_body(response).await;
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("database down")
        );
    }

    #[tokio::test]
    async fn logout_then_status_reports_unauthenticated() {
        let (app, store) = router().await;
        app.clone().oneshot(login_request("hunter2")).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.get().await.unwrap().is_empty());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/auth/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["authenticated"], false);
        assert_eq!(json["refreshing"], false);
        assert!(json.get("error").is_none());
    }
}
