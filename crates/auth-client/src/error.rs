//! Error types for authenticated requests

use auth_refresh::RefreshError;

use crate::request::Response;

/// Network-level failure. Never triggers a refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Terminal outcome of a request that did not succeed.
///
/// Every status-carrying variant holds the buffered upstream response, so
/// callers (and the proxy) can still inspect or forward it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Non-2xx response that is not expiry-class, or the response to the
    /// single retry (whatever its status).
    #[error("request failed with status {}", .response.status)]
    Status { response: Response },

    /// Expiry status, but no refresh source or refresh token.
    #[error("request failed with status {} and refresh is unavailable: {reason}", .response.status)]
    RefreshUnavailable { response: Response, reason: String },

    /// Expiry status and the refresh failed. `response` is the original
    /// failure; the refresh error is only the cause.
    #[error("request failed with status {}", .response.status)]
    Expired {
        response: Response,
        #[source]
        source: RefreshError,
    },

    #[error("credential store error: {0}")]
    Store(String),

    #[error("login failed: {0}")]
    Login(#[source] auth_store::Error),
}

impl Error {
    /// The upstream response carried by this error, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Status { response }
            | Error::RefreshUnavailable { response, .. }
            | Error::Expired { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Consume the error, returning the upstream response if any.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Error::Status { response }
            | Error::RefreshUnavailable { response, .. }
            | Error::Expired { response, .. } => Some(response),
            _ => None,
        }
    }

    /// HTTP status of the carried response.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status.as_u16())
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
