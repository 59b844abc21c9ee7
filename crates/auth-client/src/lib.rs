//! HTTP client with transparent bearer token refresh
//!
//! `AuthClient` stamps the stored access token on every request, and when the
//! upstream answers with the configured expiry status it asks the shared
//! `RefreshCoordinator` for a new token and replays the request once.
//! `Session` covers the surrounding login/logout flow.
//!
//! Request flow:
//! 1. Caller builds a `Request` (buffered, so it can be replayed verbatim)
//! 2. Defaults applied: base URL, default headers
//! 3. Request interceptor stamps `Authorization: Bearer <stored token>`
//! 4. `Transport` executes it
//! 5. 2xx → done; other status → classified by the retry engine
//! 6. Expiry with refresh available → wait for the coordinator, replay once
//!    with the new token; that outcome is final

pub mod client;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod request;
pub mod session;
pub mod transport;

pub use client::AuthClient;
pub use config::ClientConfig;
pub use error::{Error, Result, TransportError};
pub use request::{Request, Response};
pub use session::{Session, SessionConfig, SessionStatus};
pub use transport::{ReqwestTransport, Transport, TransportFuture};
