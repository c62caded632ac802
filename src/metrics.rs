use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug)]
pub struct AuthMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub refreshes_started: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
    pub refreshes_cancelled: u64,
    pub refresh_waiters_joined: u64,
    pub replays: u64,
    pub sessions_terminated: u64,
    pub in_flight: u64,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct AuthMetrics {
    inner: Arc<AuthMetricsInner>,
}

#[derive(Debug, Default)]
struct AuthMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    refreshes_started: AtomicU64,
    refreshes_succeeded: AtomicU64,
    refreshes_failed: AtomicU64,
    refreshes_cancelled: AtomicU64,
    refresh_waiters_joined: AtomicU64,
    replays: AtomicU64,
    sessions_terminated: AtomicU64,
    in_flight: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: AuthMetrics,
}

impl AuthMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_request_completed<T>(&self, result: &Result<T, Error>) {
        match result {
            Ok(_) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                let key = match error {
                    Error::HttpStatus { status, .. } => format!("http_status:{status}"),
                    Error::Transport { kind, .. } => format!("transport:{kind}"),
                    Error::AuthFailurePermanent { reason, .. } => {
                        format!("auth_failure_permanent:{}", reason.as_str())
                    }
                    other => other.code().as_str().to_owned(),
                };
                let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
                *error_counts.entry(key).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn record_refresh_started(&self) {
        self.inner.refreshes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_settled(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.inner.refreshes_succeeded
        } else {
            &self.inner.refreshes_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_cancelled(&self) {
        self.inner
            .refreshes_cancelled
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refresh_joined(&self) {
        self.inner
            .refresh_waiters_joined
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay(&self) {
        self.inner.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_terminated(&self) {
        self.inner
            .sessions_terminated
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AuthMetricsSnapshot {
        AuthMetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            refreshes_started: self.inner.refreshes_started.load(Ordering::Relaxed),
            refreshes_succeeded: self.inner.refreshes_succeeded.load(Ordering::Relaxed),
            refreshes_failed: self.inner.refreshes_failed.load(Ordering::Relaxed),
            refreshes_cancelled: self.inner.refreshes_cancelled.load(Ordering::Relaxed),
            refresh_waiters_joined: self.inner.refresh_waiters_joined.load(Ordering::Relaxed),
            replays: self.inner.replays.load(Ordering::Relaxed),
            sessions_terminated: self.inner.sessions_terminated.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
