//! Refresh coordinator state machine
//!
//! One mutex guards everything that decides whether a refresh starts: the
//! configured operation, the expiry status, and `RefreshState`. Checking for
//! an in-flight cycle and appending a waiter happen under that lock, so two
//! requests can never both start a cycle.
//!
//! A cycle's refresh operation runs on its own task, supervised by a second
//! task that applies the timeout, writes the outcome to the credential store
//! and drains the waiter list. Callers only hold a `oneshot` receiver, so a
//! caller dropping its future never strands the others.
//!
//! States:
//! - Idle → InFlight (first `acquire` with a source and a refresh token)
//! - InFlight → InFlight (further `acquire` calls join as waiters)
//! - InFlight → Idle (operation settles, times out, panics or is cancelled)
//!
//! Settling swaps the state back to Idle and takes the waiter list under the
//! lock, then resolves the waiters after releasing it. Nobody can join a
//! cycle once it has left InFlight.
//!
//! A cycle started before `clear_auth` belongs to the cleared session. Its
//! existing waiters still get its outcome, but later callers only wait for
//! it to settle and then start a cycle of their own.

use std::sync::Arc;
use std::time::Duration;

use auth_store::{CredentialStore, TokenGrant};
use common::Secret;
use tokio::sync::{Mutex, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{RefreshError, Result};
use crate::operation::{RefreshOperation, RefreshSource};

/// Status code treated as "access token expired" unless configured otherwise.
pub const DEFAULT_EXPIRY_STATUS: u16 = 401;

/// Upper bound on a single refresh operation.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

type Waiter = oneshot::Sender<Result<Secret<String>>>;

/// A running refresh cycle.
struct InFlight {
    cycle: u64,
    /// `Inner::generation` when the cycle started. A mismatch at settle time
    /// means the session was cleared meanwhile and the store must be left alone.
    generation: u64,
    waiters: Vec<Waiter>,
    abort: AbortHandle,
}

/// Where `acquire` put its waiter.
enum Bound {
    /// Joined the current session's cycle.
    Joined,
    /// Waiting on a cycle of a cleared session; its outcome is discarded.
    Detached,
    /// No cycle running; start one with this waiter.
    Start(Waiter),
}

enum RefreshState {
    Idle,
    InFlight(InFlight),
}

struct Inner {
    operation: Option<Arc<dyn RefreshOperation>>,
    expiry_status: u16,
    generation: u64,
    cycles: u64,
    state: RefreshState,
}

struct Shared {
    store: Arc<dyn CredentialStore>,
    http_client: reqwest::Client,
    timeout: Duration,
    inner: Mutex<Inner>,
}

/// How a failed response relates to token expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryClass {
    /// Status is not the configured expiry status.
    NotExpiry,
    /// Expiry status, and a refresh source plus refresh token are available.
    Refreshable,
    /// Expiry status, but refresh cannot be attempted.
    Unavailable(String),
}

/// Single-flight refresh coordinator for one session.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    /// Create an unconfigured coordinator with the default refresh timeout.
    pub fn new(store: Arc<dyn CredentialStore>, http_client: reqwest::Client) -> Self {
        Self::with_timeout(store, http_client, DEFAULT_REFRESH_TIMEOUT)
    }

    /// Create an unconfigured coordinator whose refresh operations are
    /// abandoned after `timeout`.
    pub fn with_timeout(
        store: Arc<dyn CredentialStore>,
        http_client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                http_client,
                timeout,
                inner: Mutex::new(Inner {
                    operation: None,
                    expiry_status: DEFAULT_EXPIRY_STATUS,
                    generation: 0,
                    cycles: 0,
                    state: RefreshState::Idle,
                }),
            }),
        }
    }

    /// Install the refresh source and expiry status for the session.
    ///
    /// `None` leaves refresh unavailable while still classifying
    /// `expiry_status` responses. A cycle already in flight is unaffected.
    pub async fn configure(&self, source: Option<RefreshSource>, expiry_status: u16) {
        let operation = source.map(|s| s.into_operation(&self.shared.http_client));
        let mut inner = self.shared.inner.lock().await;
        inner.operation = operation;
        inner.expiry_status = expiry_status;
        info!(
            expiry_status,
            refresh_available = inner.operation.is_some(),
            "refresh configured"
        );
    }

    /// Drop the refresh source (logout).
    ///
    /// Prevents new cycles. A cycle already in flight still settles every
    /// waiter bound to it, but no longer writes to the credential store.
    pub async fn clear_auth(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.operation = None;
        inner.generation += 1;
        info!(
            refreshing = matches!(inner.state, RefreshState::InFlight(_)),
            "refresh configuration cleared"
        );
    }

    /// The credential store this coordinator writes to.
    pub fn credential_store(&self) -> &Arc<dyn CredentialStore> {
        &self.shared.store
    }

    /// Currently configured expiry status.
    pub async fn expiry_status(&self) -> u16 {
        self.shared.inner.lock().await.expiry_status
    }

    /// Whether a refresh cycle is running.
    pub async fn is_refreshing(&self) -> bool {
        matches!(
            self.shared.inner.lock().await.state,
            RefreshState::InFlight(_)
        )
    }

    /// Number of callers bound to the running cycle (0 when idle).
    pub async fn pending_waiters(&self) -> usize {
        match &self.shared.inner.lock().await.state {
            RefreshState::Idle => 0,
            RefreshState::InFlight(flight) => flight.waiters.len(),
        }
    }

    /// Classify a failed response status.
    pub async fn classify(&self, status: u16) -> ExpiryClass {
        let inner = self.shared.inner.lock().await;
        if status != inner.expiry_status {
            return ExpiryClass::NotExpiry;
        }
        if inner.operation.is_none() {
            return ExpiryClass::Unavailable("no refresh source configured".into());
        }
        match self.shared.store.get().await {
            Ok(pair) if pair.can_refresh() => ExpiryClass::Refreshable,
            Ok(_) => ExpiryClass::Unavailable("no refresh token stored".into()),
            Err(e) => ExpiryClass::Unavailable(format!("credential store error: {e}")),
        }
    }

    /// Refresh now, or join the refresh already running.
    ///
    /// Resolves with the new access token, or with the cycle's error. Fails
    /// immediately with `Unavailable` when no source or refresh token exists.
    pub async fn acquire(&self) -> Result<Secret<String>> {
        self.acquire_inner(None).await
    }

    /// Like `acquire`, but when idle and the stored access token is no
    /// longer `stale`, return the stored token without refreshing.
    ///
    /// For requests that were sent before an earlier cycle finished: the token
    /// they were rejected with has already been replaced.
    pub async fn acquire_replacing(&self, stale: &Secret<String>) -> Result<Secret<String>> {
        self.acquire_inner(Some(stale)).await
    }

    async fn acquire_inner(&self, stale: Option<&Secret<String>>) -> Result<Secret<String>> {
        loop {
            let (tx, rx) = oneshot::channel();
            let detached = {
                let mut guard = self.shared.inner.lock().await;
                let inner = &mut *guard;
                let generation = inner.generation;

                let next = match &mut inner.state {
                    RefreshState::InFlight(flight) if flight.generation == generation => {
                        flight.waiters.push(tx);
                        debug!(
                            cycle = flight.cycle,
                            waiters = flight.waiters.len(),
                            "joined in-flight refresh"
                        );
                        Bound::Joined
                    }
                    RefreshState::InFlight(flight) => {
                        // Started by a cleared session: its token is not ours
                        if inner.operation.is_none() {
                            return Err(RefreshError::Unavailable(
                                "no refresh source configured".into(),
                            ));
                        }
                        flight.waiters.push(tx);
                        debug!(
                            cycle = flight.cycle,
                            "waiting for refresh from a cleared session to settle"
                        );
                        Bound::Detached
                    }
                    RefreshState::Idle => Bound::Start(tx),
                };

                match next {
                    Bound::Joined => false,
                    Bound::Detached => true,
                    Bound::Start(tx) => {
                        self.start_cycle(inner, tx, stale).await?;
                        false
                    }
                }
            };

            // The supervisor always drains; a dropped sender would mean it was
            // torn down with the runtime.
            let outcome = rx.await.unwrap_or(Err(RefreshError::Cancelled));
            if !detached {
                return outcome;
            }
        }
    }

    /// Start a cycle with `tx` as its first waiter. Resolves `tx` directly
    /// when the stored token already replaced `stale`.
    async fn start_cycle(
        &self,
        inner: &mut Inner,
        tx: Waiter,
        stale: Option<&Secret<String>>,
    ) -> Result<()> {
        let operation = inner
            .operation
            .clone()
            .ok_or_else(|| RefreshError::Unavailable("no refresh source configured".into()))?;
        let pair = self
            .shared
            .store
            .get()
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;

        if let (Some(stale), Some(current)) = (stale, pair.access.as_ref()) {
            if stale != current {
                debug!("access token already replaced, skipping refresh");
                let _ = tx.send(Ok(current.clone()));
                return Ok(());
            }
        }

        let refresh = pair
            .refresh
            .ok_or_else(|| RefreshError::Unavailable("no refresh token stored".into()))?;

        inner.cycles += 1;
        let cycle = inner.cycles;
        let task = tokio::spawn(async move { operation.refresh(refresh).await });
        inner.state = RefreshState::InFlight(InFlight {
            cycle,
            generation: inner.generation,
            waiters: vec![tx],
            abort: task.abort_handle(),
        });
        debug!(cycle, "starting token refresh");
        tokio::spawn(supervise(self.shared.clone(), cycle, task));
        Ok(())
    }

    /// Abort the running cycle. Every current waiter fails with `Cancelled`
    /// and the credentials are cleared, as for any failed refresh.
    ///
    /// Returns whether a cycle was running.
    pub async fn cancel(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        match &inner.state {
            RefreshState::InFlight(flight) => {
                warn!(cycle = flight.cycle, "cancelling token refresh");
                flight.abort.abort();
                true
            }
            RefreshState::Idle => false,
        }
    }
}

/// Wait for a cycle's operation and settle it.
async fn supervise(
    shared: Arc<Shared>,
    cycle: u64,
    task: JoinHandle<auth_store::Result<TokenGrant>>,
) {
    let abort = task.abort_handle();
    let outcome = match tokio::time::timeout(shared.timeout, task).await {
        Ok(Ok(Ok(grant))) => Ok(grant),
        Ok(Ok(Err(e))) => Err(RefreshError::Failed(e.to_string())),
        Ok(Err(join)) if join.is_cancelled() => Err(RefreshError::Cancelled),
        Ok(Err(join)) => Err(RefreshError::Failed(format!(
            "refresh operation panicked: {join}"
        ))),
        Err(_) => {
            abort.abort();
            Err(RefreshError::TimedOut(shared.timeout))
        }
    };

    settle(&shared, cycle, outcome).await;
}

/// Write the outcome to the store and return to Idle under the lock, then
/// resolve every waiter taken from the cycle.
async fn settle(shared: &Shared, cycle: u64, outcome: std::result::Result<TokenGrant, RefreshError>) {
    let (flight, result) = {
        let mut guard = shared.inner.lock().await;
        let inner = &mut *guard;

        let flight = match std::mem::replace(&mut inner.state, RefreshState::Idle) {
            RefreshState::InFlight(flight) if flight.cycle == cycle => flight,
            other => {
                // Only the supervisor of the running cycle leaves InFlight
                warn!(cycle, "refresh settled for a cycle that is not running");
                inner.state = other;
                return;
            }
        };
        let current = flight.generation == inner.generation;

        let result = match outcome {
            Ok(grant) => {
                if current {
                    // A missing refresh token keeps the stored one
                    if let Err(e) = shared
                        .store
                        .set(grant.access_token.clone(), grant.refresh_token)
                        .await
                    {
                        warn!(cycle, error = %e, "failed to persist refreshed token");
                    }
                } else {
                    debug!(cycle, "session cleared during refresh, not persisting token");
                }
                info!(cycle, waiters = flight.waiters.len(), "token refresh succeeded");
                metrics::counter!("auth_refresh_total", "outcome" => "success").increment(1);
                Ok(grant.access_token)
            }
            Err(e) => {
                warn!(cycle, waiters = flight.waiters.len(), error = %e, "token refresh failed");
                if current {
                    match shared.store.clear().await {
                        Ok(()) => warn!(cycle, "credentials cleared after refresh failure"),
                        Err(clear_err) => {
                            warn!(cycle, error = %clear_err, "failed to clear credentials")
                        }
                    }
                }
                metrics::counter!("auth_refresh_total", "outcome" => outcome_label(&e))
                    .increment(1);
                Err(e)
            }
        };
        (flight, result)
    };

    // Lock released: waiters were taken out with the state swap
    for waiter in flight.waiters {
        // A receiver dropped by a cancelled caller is fine to skip
        let _ = waiter.send(result.clone());
    }
}

fn outcome_label(err: &RefreshError) -> &'static str {
    match err {
        RefreshError::TimedOut(_) => "timeout",
        RefreshError::Cancelled => "cancelled",
        _ => "failure",
    }
}
