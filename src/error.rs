use http::{HeaderMap, Method};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    /// No connection was established (resolution, refusal, TLS handshake).
    Connect,
    /// The connection dropped while the exchange was in progress.
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Why a request ended up unauthenticated after the refresh path ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthFailureReason {
    /// No refresh token was stored when the first 401 arrived.
    MissingRefreshToken,
    /// The refresh endpoint answered with a non-2xx status.
    RefreshRejected { status: u16 },
    /// The refresh call never produced a response.
    RefreshTransport,
    /// The refresh call exceeded the refresh timeout.
    RefreshTimedOut,
    /// The refresh endpoint answered 2xx with an unusable payload.
    RefreshInvalidResponse,
    /// The replayed request was rejected again with a fresh token.
    ReplayUnauthorized,
}

impl AuthFailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingRefreshToken => "missing_refresh_token",
            Self::RefreshRejected { .. } => "refresh_rejected",
            Self::RefreshTransport => "refresh_transport",
            Self::RefreshTimedOut => "refresh_timed_out",
            Self::RefreshInvalidResponse => "refresh_invalid_response",
            Self::ReplayUnauthorized => "replay_unauthorized",
        }
    }
}

impl std::fmt::Display for AuthFailureReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RefreshRejected { status } => write!(formatter, "refresh_rejected({status})"),
            other => formatter.write_str(other.as_str()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    RequestBuild,
    Transport,
    Timeout,
    ReadBody,
    ResponseBodyTooLarge,
    HttpStatus,
    Deserialize,
    InvalidHeaderName,
    InvalidHeaderValue,
    TlsBackendInit,
    AuthFailurePermanent,
    RefreshCancelled,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::RequestBuild => "request_build",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::TlsBackendInit => "tls_backend_init",
            Self::AuthFailurePermanent => "auth_failure_permanent",
            Self::RefreshCancelled => "refresh_cancelled",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body exceeds {limit_bytes} bytes for {method} {uri}")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: String,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to initialize tls backend: {message}")]
    TlsBackendInit { message: String },
    #[error("authentication failed permanently ({reason}) for {method} {uri}")]
    AuthFailurePermanent {
        reason: AuthFailureReason,
        method: Method,
        uri: String,
    },
    #[error("token refresh cancelled by session teardown for {method} {uri}")]
    RefreshCancelled { method: Method, uri: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
            Self::AuthFailurePermanent { .. } => ErrorCode::AuthFailurePermanent,
            Self::RefreshCancelled { .. } => ErrorCode::RefreshCancelled,
        }
    }

    /// True for the error kinds the application shell should route to a
    /// login surface.
    pub const fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::AuthFailurePermanent { .. } | Self::RefreshCancelled { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
