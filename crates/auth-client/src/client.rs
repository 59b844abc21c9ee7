//! Authenticated client and retry engine
//!
//! Per request:
//!
//! ```text
//! SENT -> (2xx) DONE
//!         (non-expiry failure) FAILED
//!         (expiry, retry already used) FAILED
//!         (expiry, first attempt) -> AWAITING_REFRESH -> RETRY_SENT -> DONE | FAILED
//! ```
//!
//! The "retry already used" flag is the `Attempt` value threaded through the
//! send loop; nothing is stored on the request itself.

use std::sync::Arc;

use auth_refresh::{ExpiryClass, RefreshCoordinator};
use common::Secret;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::interceptor;
use crate::request::{Request, Response};
use crate::transport::Transport;

/// Which send of the original request this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    /// The single replay after a refresh. Its outcome is final.
    Retry,
}

/// HTTP client that attaches the session's bearer token and refreshes it on
/// expiry.
///
/// Cheap to clone; clones share the transport and the coordinator.
#[derive(Clone)]
pub struct AuthClient {
    transport: Arc<dyn Transport>,
    coordinator: RefreshCoordinator,
    config: ClientConfig,
}

impl AuthClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        coordinator: RefreshCoordinator,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            coordinator,
            config,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// GET a URL (absolute, or relative to the configured base URL).
    pub async fn get(&self, url: impl Into<String>) -> Result<Response> {
        self.send(Request::get(url)).await
    }

    /// Send a request, refreshing the token and replaying once on expiry.
    ///
    /// Returns the 2xx response, or the single terminal error: the original
    /// failure for non-expiry statuses and failed refreshes, the retry's own
    /// failure otherwise.
    pub async fn send(&self, mut request: Request) -> Result<Response> {
        self.config.apply(&mut request)?;
        let original = request;

        let mut attempt = Attempt::First;
        let mut token = self.stored_token().await?;

        loop {
            let response = match self.dispatch(&original, token.as_ref()).await {
                Ok(response) => response,
                Err(e) => {
                    if attempt == Attempt::Retry {
                        metrics::counter!("auth_retry_total", "outcome" => "transport").increment(1);
                    }
                    return Err(e);
                }
            };
            if response.is_success() {
                if attempt == Attempt::Retry {
                    metrics::counter!("auth_retry_total", "outcome" => "success").increment(1);
                }
                return Ok(response);
            }

            if attempt == Attempt::Retry {
                if response.status.as_u16() == self.coordinator.expiry_status().await {
                    warn!(
                        status = response.status.as_u16(),
                        url = %original.url,
                        "credentials still rejected after refresh, not retrying again"
                    );
                    metrics::counter!("auth_retry_total", "outcome" => "exhausted").increment(1);
                } else {
                    metrics::counter!("auth_retry_total", "outcome" => "failure").increment(1);
                }
                return Err(Error::Status { response });
            }

            let fresh = self.await_refresh(response, token.as_ref()).await?;
            debug!(method = %original.method, url = %original.url, "retrying with refreshed token");
            token = Some(fresh);
            attempt = Attempt::Retry;
        }
    }

    /// Classify a first-attempt failure and, if expiry-class, wait for the
    /// coordinator. Consumes the response into the error on every failure
    /// path.
    async fn await_refresh(
        &self,
        response: Response,
        used: Option<&Secret<String>>,
    ) -> Result<Secret<String>> {
        match self.coordinator.classify(response.status.as_u16()).await {
            ExpiryClass::NotExpiry => Err(Error::Status { response }),
            ExpiryClass::Unavailable(reason) => {
                debug!(status = response.status.as_u16(), %reason, "expiry without refresh");
                Err(Error::RefreshUnavailable { response, reason })
            }
            ExpiryClass::Refreshable => {
                let refreshed = match used {
                    Some(used) => self.coordinator.acquire_replacing(used).await,
                    None => self.coordinator.acquire().await,
                };
                match refreshed {
                    Ok(token) => Ok(token),
                    Err(e) if e.is_unavailable() => Err(Error::RefreshUnavailable {
                        response,
                        reason: e.to_string(),
                    }),
                    Err(source) => Err(Error::Expired { response, source }),
                }
            }
        }
    }

    /// Stamp `token` onto a copy of the original request and execute it.
    async fn dispatch(&self, original: &Request, token: Option<&Secret<String>>) -> Result<Response> {
        let mut request = original.clone();
        interceptor::authorize(&mut request.headers, token)?;
        Ok(self.transport.execute(request).await?)
    }

    /// Access token as stored right now; never cached across requests.
    async fn stored_token(&self) -> Result<Option<Secret<String>>> {
        let pair = self
            .coordinator
            .credential_store()
            .get()
            .await
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(pair.access)
    }
}
