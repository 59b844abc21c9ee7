//! Transport abstraction
//!
//! The retry engine only needs "send this request, give me the buffered
//! response". `ReqwestTransport` is the production implementation; tests
//! substitute scripted transports.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::error::TransportError;
use crate::request::{Request, Response};

/// Boxed future returned by `Transport::execute`.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send + 'a>>;

/// Executes a fully formed request.
///
/// Any HTTP response, whatever its status, is `Ok`; `Err` is reserved for
/// network-level failures.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn execute(&self, request: Request) -> TransportFuture<'_>;
}

/// `reqwest`-backed transport with an optional per-request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    pub fn with_timeout(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout: Some(timeout),
        }
    }
}

impl Transport for ReqwestTransport {
    fn execute(&self, request: Request) -> TransportFuture<'_> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method, &request.url)
                .headers(request.headers)
                .body(request.body);
            if let Some(timeout) = self.timeout {
                builder = builder.timeout(timeout);
            }

            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");

            Ok(Response {
                status,
                headers,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tokio::net::TcpListener;

    async fn serve(router: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn non_2xx_is_a_response_not_an_error() {
        let router = axum::Router::new().fallback(|| async {
            (StatusCode::UNAUTHORIZED, [("x-reason", "expired")], "token expired")
        });
        let base = serve(router).await;

        let transport = ReqwestTransport::new(reqwest::Client::new());
        let response = transport
            .execute(Request::get(format!("{base}/me")))
            .await
            .unwrap();
        assert_eq!(response.status.as_u16(), 401);
        assert_eq!(response.headers["x-reason"], "expired");
        assert_eq!(response.text(), "token expired");
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let transport = ReqwestTransport::new(reqwest::Client::new());
        let err = transport
            .execute(Request::get("http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn slow_upstream_is_timeout_error() {
        let router = axum::Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        });
        let base = serve(router).await;

        let transport =
            ReqwestTransport::with_timeout(reqwest::Client::new(), Duration::from_millis(100));
        let err = transport
            .execute(Request::get(format!("{base}/slow")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got: {err:?}");
    }
}
