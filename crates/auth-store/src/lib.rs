//! Bearer credential storage and token endpoint calls
//!
//! Holds the one access/refresh token pair a client session works with, and
//! the two HTTP interactions that produce new pairs. This crate knows nothing
//! about refresh coordination or retries; it is the collaborator the
//! coordinator and the request interceptor talk to.
//!
//! Credential flow:
//! 1. Session calls `token::login()` with caller-supplied credentials
//! 2. Tokens stored via `CredentialStore::set()`
//! 3. Request interceptor reads `CredentialStore::get()` before every send
//! 4. On expiry the coordinator calls `token::refresh_token()` (via its
//!    configured refresh operation) and writes the new pair back
//! 5. Logout, or a failed refresh, calls `CredentialStore::clear()`

pub mod credentials;
pub mod error;
pub mod token;

pub use credentials::{CredentialStore, FileStore, MemoryStore, TokenPair};
pub use error::{Error, Result};
pub use token::{LoginResponse, TokenGrant, login, refresh_token};
