use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{Span, debug, warn};

use crate::classify::{Classification, classify, pass_through};
use crate::error::{AuthFailureReason, Error};
use crate::metrics::AuthMetrics;
use crate::observe::Observers;
use crate::request::PendingRequest;
use crate::response::Response;
use crate::session::{SessionEndReason, SessionTerminator};
use crate::transport::{Transport, dispatch};

/// Re-issues a captured request exactly once with the refreshed token.
pub(crate) struct ReplayExecutor<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) auth_failure_statuses: &'a BTreeSet<u16>,
    pub(crate) terminator: &'a SessionTerminator,
    pub(crate) metrics: &'a AuthMetrics,
    pub(crate) observers: &'a Observers,
}

impl ReplayExecutor<'_> {
    pub(crate) async fn replay(
        &self,
        pending: PendingRequest,
        access_token: Arc<str>,
    ) -> crate::Result<Response> {
        let pending = pending.into_replay(access_token);
        self.metrics.record_replay();
        self.observers
            .replay(pending.method(), pending.redacted_uri());
        Span::current().record("attempt", pending.attempt().number());
        debug!("replaying request with refreshed token");

        let outcome = dispatch(self.transport, &pending).await;
        match classify(&outcome, pending.attempt(), self.auth_failure_statuses) {
            Classification::Success | Classification::OtherFailure => {
                pass_through(outcome, pending.method(), pending.redacted_uri())
            }
            Classification::AuthExpired | Classification::AuthFailurePermanent => {
                warn!("replayed request rejected with refreshed token");
                Err(self.end_session(&pending, AuthFailureReason::ReplayUnauthorized))
            }
        }
    }

    pub(crate) fn end_session(&self, pending: &PendingRequest, reason: AuthFailureReason) -> Error {
        self.terminator
            .terminate(SessionEndReason::Unauthenticated(reason));
        Error::AuthFailurePermanent {
            reason,
            method: pending.method().clone(),
            uri: pending.redacted_uri().to_owned(),
        }
    }
}
