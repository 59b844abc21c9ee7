//! Refresh operations
//!
//! A refresh operation turns the stored refresh token into a new
//! `TokenGrant`. The session picks one when it configures the coordinator:
//! either a refresh URL (wrapped in `EndpointRefresher`) or any closure.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use auth_store::TokenGrant;
use common::Secret;

/// Boxed future returned by `RefreshOperation::refresh`.
pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = auth_store::Result<TokenGrant>> + Send + 'a>>;

/// Exchanges a refresh token for a new grant.
///
/// Invoked at most once per refresh cycle, on a task of its own.
pub trait RefreshOperation: Send + Sync {
    fn refresh(&self, refresh_token: Secret<String>) -> RefreshFuture<'_>;
}

impl<F, Fut> RefreshOperation for F
where
    F: Fn(Secret<String>) -> Fut + Send + Sync,
    Fut: Future<Output = auth_store::Result<TokenGrant>> + Send + 'static,
{
    fn refresh(&self, refresh_token: Secret<String>) -> RefreshFuture<'_> {
        Box::pin(self(refresh_token))
    }
}

/// Refresh by POSTing to a refresh URL.
pub struct EndpointRefresher {
    client: reqwest::Client,
    url: String,
}

impl EndpointRefresher {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RefreshOperation for EndpointRefresher {
    fn refresh(&self, refresh_token: Secret<String>) -> RefreshFuture<'_> {
        Box::pin(async move {
            auth_store::refresh_token(&self.client, &self.url, &refresh_token).await
        })
    }
}

/// Where a configured coordinator gets new tokens from.
#[derive(Clone)]
pub enum RefreshSource {
    /// POST `{"refresh_token": ...}` to this URL.
    Endpoint(String),
    /// Caller-supplied operation.
    Operation(Arc<dyn RefreshOperation>),
}

impl RefreshSource {
    /// Wrap a closure or custom operation.
    pub fn operation(op: impl RefreshOperation + 'static) -> Self {
        RefreshSource::Operation(Arc::new(op))
    }

    pub(crate) fn into_operation(self, client: &reqwest::Client) -> Arc<dyn RefreshOperation> {
        match self {
            RefreshSource::Endpoint(url) => Arc::new(EndpointRefresher::new(client.clone(), url)),
            RefreshSource::Operation(op) => op,
        }
    }
}

impl fmt::Debug for RefreshSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshSource::Endpoint(url) => f.debug_tuple("Endpoint").field(url).finish(),
            RefreshSource::Operation(_) => f.write_str("Operation(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_refresh_operations() {
        let op = |token: Secret<String>| async move {
            Ok::<_, auth_store::Error>(TokenGrant::new(format!("at_for_{}", token.expose()), None))
        };
        let grant = op.refresh(Secret::from("rt_1")).await.unwrap();
        assert_eq!(grant.access_token.expose(), "at_for_rt_1");
    }

    #[tokio::test]
    async fn endpoint_refresher_surfaces_transport_errors() {
        let refresher = EndpointRefresher::new(reqwest::Client::new(), "http://127.0.0.1:1/refresh");
        let err = refresher.refresh(Secret::from("rt_1")).await.unwrap_err();
        assert!(matches!(err, auth_store::Error::Http(_)), "got: {err:?}");
    }

    #[test]
    fn debug_hides_operation_internals() {
        let source = RefreshSource::operation(|_token: Secret<String>| async {
            Ok::<_, auth_store::Error>(TokenGrant::new("at", None))
        });
        assert_eq!(format!("{source:?}"), "Operation(..)");
        let endpoint = RefreshSource::Endpoint("https://auth.example.com/refresh".into());
        assert!(format!("{endpoint:?}").contains("auth.example.com"));
    }
}
