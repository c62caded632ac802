use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AuthFailureReason, Error};
use crate::transport::Transport;
use crate::util::{body_excerpt, parse_base_url, redact_uri, request_url, to_http_uri};

pub(crate) const DEFAULT_REFRESH_PATH: &str = "/auth/refresh-token";

/// Result of a successful refresh exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present when the endpoint rotates the refresh token.
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RefreshedToken")
            .field("access_token", &"<redacted>")
            .field("rotated", &self.refresh_token.is_some())
            .finish()
    }
}

impl RefreshedToken {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RefreshError {
    #[error("refresh endpoint rejected the refresh token with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("refresh request failed before a response arrived: {source}")]
    Transport {
        #[source]
        source: Error,
    },
    #[error("invalid refresh response: {message}")]
    InvalidResponse { message: String },
}

impl RefreshError {
    pub const fn reason(&self) -> AuthFailureReason {
        match self {
            Self::Rejected { status, .. } => AuthFailureReason::RefreshRejected { status: *status },
            Self::Transport { .. } => AuthFailureReason::RefreshTransport,
            Self::InvalidResponse { .. } => AuthFailureReason::RefreshInvalidResponse,
        }
    }
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait RefreshEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// `POST <base>/auth/refresh-token {"refreshToken"} -> {"accessToken"}`.
///
/// Sends straight through the transport, so a 401 from the refresh endpoint
/// can never re-enter the refresh path.
#[derive(Clone)]
pub struct HttpRefreshEndpoint {
    transport: Arc<dyn Transport>,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
}

impl HttpRefreshEndpoint {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: &str,
        refresh_path: &str,
    ) -> crate::Result<Self> {
        let url = request_url(&parse_base_url(base_url)?, refresh_path, &[])?;
        let uri = to_http_uri(&url)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(Self {
            transport,
            uri: uri.clone(),
            redacted_uri: redact_uri(&uri),
            headers,
        })
    }

    /// Extra headers sent with every refresh call; `Authorization` is never
    /// among them.
    pub(crate) fn with_default_headers(mut self, default_headers: &HeaderMap) -> Self {
        for (name, value) in default_headers {
            if !self.headers.contains_key(name) {
                self.headers.insert(name.clone(), value.clone());
            }
        }
        self.headers.remove(http::header::AUTHORIZATION);
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    fn build_request(&self, refresh_token: &str) -> Result<Request<Bytes>, RefreshError> {
        let payload = serde_json::to_vec(&RefreshTokenRequest { refresh_token }).map_err(
            |source| RefreshError::Transport {
                source: Error::SerializeJson { source },
            },
        )?;
        let mut request_builder = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone());
        for (name, value) in &self.headers {
            request_builder = request_builder.header(name, value);
        }
        request_builder
            .body(Bytes::from(payload))
            .map_err(|source| RefreshError::Transport {
                source: Error::RequestBuild { source },
            })
    }
}

impl std::fmt::Debug for HttpRefreshEndpoint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRefreshEndpoint")
            .field("uri", &self.redacted_uri)
            .finish()
    }
}

#[async_trait]
impl RefreshEndpoint for HttpRefreshEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        let request = self.build_request(refresh_token)?;
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|source| RefreshError::Transport { source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body: body_excerpt(response.body()),
            });
        }

        let payload: RefreshTokenResponse =
            serde_json::from_slice(response.body()).map_err(|source| {
                RefreshError::InvalidResponse {
                    message: source.to_string(),
                }
            })?;
        if payload.access_token.is_empty() {
            return Err(RefreshError::InvalidResponse {
                message: "empty accessToken".to_owned(),
            });
        }

        Ok(RefreshedToken {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token.filter(|token| !token.is_empty()),
        })
    }
}
