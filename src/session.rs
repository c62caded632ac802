use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::credentials::CredentialStore;
use crate::error::AuthFailureReason;
use crate::metrics::AuthMetrics;
use crate::observe::Observers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The refresh path could not produce a usable token.
    Unauthenticated(AuthFailureReason),
    /// The application asked for the session to end.
    Logout,
}

impl std::fmt::Display for SessionEndReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated(reason) => write!(formatter, "unauthenticated({reason})"),
            Self::Logout => formatter.write_str("logout"),
        }
    }
}

/// Clears credentials and emits the session-ended signal at most once per
/// session. A session starts when credentials are established or a refresh
/// begins with a stored refresh token.
pub(crate) struct SessionTerminator {
    store: Arc<dyn CredentialStore>,
    observers: Observers,
    metrics: AuthMetrics,
    ended: AtomicBool,
}

impl SessionTerminator {
    pub(crate) fn new(
        store: Arc<dyn CredentialStore>,
        observers: Observers,
        metrics: AuthMetrics,
    ) -> Self {
        Self {
            store,
            observers,
            metrics,
            ended: AtomicBool::new(false),
        }
    }

    /// Returns whether this call performed the termination.
    pub(crate) fn terminate(&self, reason: SessionEndReason) -> bool {
        let claimed = self.claim(reason);
        if claimed {
            self.announce(reason);
        }
        claimed
    }

    /// Marks the session ended and clears credentials without running
    /// observers, so it is safe to call while holding another lock. A `true`
    /// return must be followed by [`Self::announce`].
    pub(crate) fn claim(&self, reason: SessionEndReason) -> bool {
        if self
            .ended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(%reason, "session already ended");
            return false;
        }

        self.store.clear_all();
        self.metrics.record_session_terminated();
        true
    }

    pub(crate) fn announce(&self, reason: SessionEndReason) {
        info!(%reason, "session ended; credentials cleared");
        self.observers.session_ended(&reason);
    }

    pub(crate) fn rearm(&self) {
        self.ended.store(false, Ordering::Release);
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}
