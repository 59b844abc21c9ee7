//! Credential storage for the session's token pair
//!
//! `CredentialStore` is the seam between the refresh machinery and wherever
//! tokens actually live. Two implementations ship: `MemoryStore` for tests and
//! short-lived clients, and `FileStore`, a JSON file that survives restarts.
//!
//! All file writes use atomic temp-file + rename to prevent corruption on
//! crash. A tokio Mutex serializes concurrent writes from refresh, login and
//! logout; reads clone the in-memory pair so they never wait on disk I/O.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by `CredentialStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The access/refresh pair as seen at one point in time.
///
/// Either half may be missing: a fresh process has neither, a login response
/// without a refresh token yields an access token only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPair {
    pub access: Option<Secret<String>>,
    pub refresh: Option<Secret<String>>,
}

impl TokenPair {
    /// Whether a refresh credential is available.
    pub fn can_refresh(&self) -> bool {
        self.refresh.is_some()
    }

    /// Whether neither token is present.
    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.refresh.is_none()
    }

    /// Apply a `set`: the access token is replaced, the refresh token only
    /// when a new one is supplied.
    fn apply(&mut self, access: Secret<String>, refresh: Option<Secret<String>>) {
        self.access = Some(access);
        if let Some(refresh) = refresh {
            self.refresh = Some(refresh);
        }
    }
}

/// Storage for the session's tokens.
///
/// Implementations must not block unboundedly: the refresh coordinator calls
/// them while holding its state lock.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Current token pair.
    fn get(&self) -> StoreFuture<'_, TokenPair>;

    /// Replace the access token. The refresh token is replaced only when
    /// `refresh` is `Some`; otherwise the stored one is kept.
    fn set(&self, access: Secret<String>, refresh: Option<Secret<String>>)
    -> StoreFuture<'_, ()>;

    /// Remove both tokens.
    fn clear(&self) -> StoreFuture<'_, ()>;
}

/// In-memory token store. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<TokenPair>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with tokens.
    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Self {
        Self {
            state: Mutex::new(TokenPair {
                access: access.map(Secret::from),
                refresh: refresh.map(Secret::from),
            }),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self) -> StoreFuture<'_, TokenPair> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn set(
        &self,
        access: Secret<String>,
        refresh: Option<Secret<String>>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.apply(access, refresh);
            Ok(())
        })
    }

    fn clear(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            *self.state.lock().await = TokenPair::default();
            Ok(())
        })
    }
}

/// On-disk representation. Field names match the conventional
/// `access_token` / `refresh_token` keys.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl From<&TokenPair> for StoredTokens {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: pair.access.as_ref().map(|s| s.expose().clone()),
            refresh_token: pair.refresh.as_ref().map(|s| s.expose().clone()),
        }
    }
}

impl From<StoredTokens> for TokenPair {
    fn from(stored: StoredTokens) -> Self {
        Self {
            access: stored.access_token.map(Secret::new),
            refresh: stored.refresh_token.map(Secret::new),
        }
    }
}

/// JSON-file token store.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// the in-memory pair, so request-time reads don't block on disk.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<TokenPair>,
}

impl FileStore {
    /// Load tokens from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start, logged out).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading token file: {e}")))?;
            let stored: StoredTokens = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}")))?;
            let pair = TokenPair::from(stored);
            info!(
                path = %path.display(),
                has_access = pair.access.is_some(),
                has_refresh = pair.refresh.is_some(),
                "loaded tokens"
            );
            pair
        } else {
            info!(path = %path.display(), "token file not found, starting logged out");
            let pair = TokenPair::default();
            write_atomic(&path, &pair).await?;
            pair
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn get(&self) -> StoreFuture<'_, TokenPair> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn set(
        &self,
        access: Secret<String>,
        refresh: Option<Secret<String>>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.apply(access, refresh);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!("stored tokens");
            Ok(())
        })
    }

    fn clear(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let empty = TokenPair::default();
            write_atomic(&self.path, &empty).await?;
            *state = empty;
            debug!("cleared tokens");
            Ok(())
        })
    }
}

/// Write tokens to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains bearer credentials.
async fn write_atomic(path: &Path, pair: &TokenPair) -> Result<()> {
    let json = serde_json::to_string_pretty(&StoredTokens::from(pair))
        .map_err(|e| Error::CredentialParse(format!("serializing tokens: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted tokens");
    Ok(())
}
