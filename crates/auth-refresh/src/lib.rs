//! Single-flight bearer token refresh
//!
//! Coordinates the refresh of one session's access token across any number
//! of concurrent requests. The coordinator reads and writes tokens through
//! `auth_store::CredentialStore` and runs whatever `RefreshOperation` the
//! session configured.
//!
//! Refresh lifecycle:
//! 1. Session configures a refresh source on login → `configure()`
//! 2. A request sees the expiry status → `acquire()` starts a refresh cycle
//! 3. Further expiry failures while the cycle runs join it as waiters
//! 4. Cycle succeeds → tokens persisted, every waiter gets the new token
//! 5. Cycle fails, times out or is cancelled → credentials cleared, every
//!    waiter gets the error
//! 6. Logout → `clear_auth()`; a running cycle still settles its waiters

pub mod coordinator;
pub mod error;
pub mod operation;

pub use coordinator::{
    DEFAULT_EXPIRY_STATUS, DEFAULT_REFRESH_TIMEOUT, ExpiryClass, RefreshCoordinator,
};
pub use error::{RefreshError, Result};
pub use operation::{EndpointRefresher, RefreshFuture, RefreshOperation, RefreshSource};
