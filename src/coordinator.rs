//! Single-flight token refresh.
//!
//! The first caller to hit an expired token moves the shared state from
//! `Idle` to `Refreshing` and spawns the refresh call; every later caller
//! only appends a waiter. The check, the transition and the enqueue all
//! happen under one mutex, so at most one refresh is ever in flight. When the
//! call settles, the new token is stored, the state returns to `Idle` and the
//! waiter list is drained in one pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::credentials::CredentialStore;
use crate::error::AuthFailureReason;
use crate::metrics::AuthMetrics;
use crate::observe::Observers;
use crate::refresh::{RefreshEndpoint, RefreshedToken};
use crate::session::{SessionEndReason, SessionTerminator};
use crate::util::lock_unpoisoned;

pub(crate) const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RefreshOutcome {
    Refreshed(Arc<str>),
    Failed(AuthFailureReason),
    Cancelled,
}

struct Waiter {
    sender: oneshot::Sender<RefreshOutcome>,
}

impl Waiter {
    fn settle(self, outcome: RefreshOutcome) {
        // The caller may have gone away; its outcome is simply dropped.
        let _ = self.sender.send(outcome);
    }
}

enum RefreshState {
    Idle,
    Refreshing {
        generation: u64,
        waiters: Vec<Waiter>,
        task: Option<AbortHandle>,
    },
}

pub(crate) struct RefreshCoordinatorOptions {
    pub(crate) client_name: String,
    pub(crate) refresh_timeout: Duration,
    pub(crate) persist_refreshed_token: bool,
}

#[derive(Clone)]
pub(crate) struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    state: Mutex<RefreshState>,
    next_generation: AtomicU64,
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn RefreshEndpoint>,
    terminator: Arc<SessionTerminator>,
    metrics: AuthMetrics,
    observers: Observers,
    options: RefreshCoordinatorOptions,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn RefreshEndpoint>,
        terminator: Arc<SessionTerminator>,
        metrics: AuthMetrics,
        observers: Observers,
        options: RefreshCoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(RefreshState::Idle),
                next_generation: AtomicU64::new(1),
                store,
                endpoint,
                terminator,
                metrics,
                observers,
                options,
            }),
        }
    }

    /// Registers a waiter for the token that replaces `stale_token`.
    ///
    /// Joins the in-flight refresh if there is one. Otherwise, if the store
    /// already holds a different access token (a refresh settled while the
    /// caller's request was in flight), resolves immediately with it.
    /// Otherwise starts a refresh, or, with no refresh token stored, rejects
    /// at once and ends the session without any network call.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn coordinate(
        &self,
        stale_token: Option<&str>,
    ) -> oneshot::Receiver<RefreshOutcome> {
        let (sender, receiver) = oneshot::channel();
        let waiter = Waiter { sender };

        let mut state = lock_unpoisoned(&self.inner.state);
        if let RefreshState::Refreshing { waiters, .. } = &mut *state {
            waiters.push(waiter);
            self.inner.metrics.record_refresh_joined();
            debug!(waiters = waiters.len(), "joined in-flight token refresh");
            return receiver;
        }

        if let Some(current) = self.inner.store.access_token()
            && stale_token != Some(current.as_str())
        {
            drop(state);
            debug!("access token already rotated; skipping refresh");
            waiter.settle(RefreshOutcome::Refreshed(Arc::from(current)));
            return receiver;
        }

        let Some(refresh_token) = self.inner.store.refresh_token() else {
            drop(state);
            warn!("no refresh token stored; ending session without refresh call");
            let reason = AuthFailureReason::MissingRefreshToken;
            self.inner
                .terminator
                .terminate(SessionEndReason::Unauthenticated(reason));
            waiter.settle(RefreshOutcome::Failed(reason));
            return receiver;
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.terminator.rearm();
        let inner = Arc::clone(&self.inner);
        let span = info_span!(
            "authx.refresh",
            client = %self.inner.options.client_name,
            generation = generation
        );
        let task = tokio::spawn(
            async move {
                inner.run_refresh(generation, refresh_token).await;
            }
            .instrument(span),
        );
        *state = RefreshState::Refreshing {
            generation,
            waiters: vec![waiter],
            task: Some(task.abort_handle()),
        };
        receiver
    }

    /// Rejects every waiter with [`RefreshOutcome::Cancelled`] and aborts the
    /// in-flight refresh. Returns the number of waiters released.
    pub(crate) fn cancel(&self) -> usize {
        let previous = std::mem::replace(
            &mut *lock_unpoisoned(&self.inner.state),
            RefreshState::Idle,
        );
        let RefreshState::Refreshing {
            generation,
            waiters,
            task,
        } = previous
        else {
            return 0;
        };

        if let Some(task) = task {
            task.abort();
        }
        self.inner.metrics.record_refresh_cancelled();
        let released = waiters.len();
        warn!(generation, waiters = released, "token refresh cancelled");
        for waiter in waiters {
            waiter.settle(RefreshOutcome::Cancelled);
        }
        released
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        matches!(
            *lock_unpoisoned(&self.inner.state),
            RefreshState::Refreshing { .. }
        )
    }
}

impl CoordinatorInner {
    async fn run_refresh(&self, generation: u64, refresh_token: String) {
        self.metrics.record_refresh_started();
        self.observers.refresh_started();
        debug!("calling refresh endpoint");

        let refresh_timeout = self.options.refresh_timeout;
        let result = match timeout(refresh_timeout, self.endpoint.refresh(&refresh_token)).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(error)) => {
                warn!(error = %error, "refresh endpoint call failed");
                Err(error.reason())
            }
            Err(_) => {
                warn!(
                    timeout_ms = refresh_timeout.as_millis() as u64,
                    "refresh endpoint call timed out"
                );
                Err(AuthFailureReason::RefreshTimedOut)
            }
        };
        self.settle(generation, result);
    }

    fn settle(&self, generation: u64, result: Result<RefreshedToken, AuthFailureReason>) {
        let (waiters, ended_session) = {
            let mut state = lock_unpoisoned(&self.state);
            let current = matches!(
                &*state,
                RefreshState::Refreshing { generation: active, .. } if *active == generation
            );
            if !current {
                debug!("refresh settled after cancellation; outcome discarded");
                return;
            }
            // Credentials change before the state leaves `Refreshing`: any
            // 401 handled after this sees either the new access token or no
            // refresh token at all.
            let ended_session = match &result {
                Ok(token) => {
                    let persistent = self.options.persist_refreshed_token;
                    self.store.set_access_token(&token.access_token, persistent);
                    if let Some(refresh_token) = &token.refresh_token {
                        self.store.set_refresh_token(refresh_token, persistent);
                    }
                    None
                }
                Err(reason) => {
                    let reason = SessionEndReason::Unauthenticated(*reason);
                    self.terminator.claim(reason).then_some(reason)
                }
            };
            let waiters = match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { waiters, .. } => waiters,
                RefreshState::Idle => Vec::new(),
            };
            (waiters, ended_session)
        };

        self.metrics.record_refresh_settled(result.is_ok());
        self.observers.refresh_settled(result.is_ok());
        match result {
            Ok(token) => {
                info!(waiters = waiters.len(), "token refresh succeeded");
                let access_token: Arc<str> = Arc::from(token.access_token);
                for waiter in waiters {
                    waiter.settle(RefreshOutcome::Refreshed(Arc::clone(&access_token)));
                }
            }
            Err(reason) => {
                warn!(%reason, waiters = waiters.len(), "token refresh failed");
                if let Some(ended_session) = ended_session {
                    self.terminator.announce(ended_session);
                }
                for waiter in waiters {
                    waiter.settle(RefreshOutcome::Failed(reason));
                }
            }
        }
    }
}
