use std::collections::BTreeSet;

use http::{Method, StatusCode};

use crate::error::Error;
use crate::request::Attempt;
use crate::response::Response;

pub(crate) const DEFAULT_AUTH_FAILURE_STATUS: u16 = 401;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// First attempt was rejected; eligible for refresh and replay.
    AuthExpired,
    /// A replay was rejected too. Never refreshed again.
    AuthFailurePermanent,
    OtherFailure,
}

pub(crate) fn default_auth_failure_statuses() -> BTreeSet<u16> {
    BTreeSet::from([DEFAULT_AUTH_FAILURE_STATUS])
}

pub fn classify_status(
    status: StatusCode,
    attempt: Attempt,
    auth_failure_statuses: &BTreeSet<u16>,
) -> Classification {
    if status.is_success() {
        return Classification::Success;
    }
    if !auth_failure_statuses.contains(&status.as_u16()) {
        return Classification::OtherFailure;
    }
    if attempt.is_replay() {
        Classification::AuthFailurePermanent
    } else {
        Classification::AuthExpired
    }
}

/// Transport errors never reach the refresh path.
pub fn classify(
    outcome: &crate::Result<Response>,
    attempt: Attempt,
    auth_failure_statuses: &BTreeSet<u16>,
) -> Classification {
    match outcome {
        Ok(response) => classify_status(response.status(), attempt, auth_failure_statuses),
        Err(_) => Classification::OtherFailure,
    }
}

/// Hands an `OtherFailure` outcome back to the caller, turning non-2xx
/// responses into [`Error::HttpStatus`] with status, headers and body kept.
pub(crate) fn pass_through(
    outcome: crate::Result<Response>,
    method: &Method,
    redacted_uri: &str,
) -> crate::Result<Response> {
    let response = outcome?;
    if response.status().is_success() {
        return Ok(response);
    }
    Err(Error::HttpStatus {
        status: response.status().as_u16(),
        method: method.clone(),
        uri: redacted_uri.to_owned(),
        headers: Box::new(response.headers().clone()),
        body: crate::util::body_excerpt(response.body()),
    })
}
