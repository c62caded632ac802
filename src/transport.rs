use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use crate::error::{Error, TransportErrorKind};
use crate::request::PendingRequest;
use crate::util::redact_uri;

pub(crate) const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// The underlying `send(request) -> response | error` primitive.
///
/// Any HTTP status is a response, not an error; only failures that leave no
/// response behind are returned as `Err`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> crate::Result<Response<Bytes>>;
}

#[cfg(feature = "tls-rustls-ring")]
type RustlsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

#[derive(Clone)]
enum TransportClient {
    Plain(Client<HttpConnector, Full<Bytes>>),
    #[cfg(feature = "tls-rustls-ring")]
    Rustls(Client<RustlsConnector, Full<Bytes>>),
}

/// Pooled HTTP/1.1 + HTTP/2 transport on `hyper-util`.
#[derive(Clone)]
pub struct HyperTransport {
    client: TransportClient,
    max_response_body_bytes: usize,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.client {
            TransportClient::Plain(_) => "plain",
            #[cfg(feature = "tls-rustls-ring")]
            TransportClient::Rustls(_) => "rustls-ring",
        };
        formatter
            .debug_struct("HyperTransport")
            .field("backend", &backend)
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish()
    }
}

impl HyperTransport {
    /// TLS-capable when the `tls-rustls-ring` feature is enabled, plain HTTP
    /// otherwise.
    pub fn new() -> crate::Result<Self> {
        #[cfg(feature = "tls-rustls-ring")]
        {
            Self::rustls_ring()
        }
        #[cfg(not(feature = "tls-rustls-ring"))]
        {
            Ok(Self::plain())
        }
    }

    pub fn plain() -> Self {
        let transport = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(DEFAULT_POOL_MAX_IDLE_PER_HOST)
            .build(HttpConnector::new());
        Self {
            client: TransportClient::Plain(transport),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }

    #[cfg(feature = "tls-rustls-ring")]
    pub fn rustls_ring() -> crate::Result<Self> {
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| Error::TlsBackendInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let transport = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(DEFAULT_POOL_MAX_IDLE_PER_HOST)
            .build(https);
        Ok(Self {
            client: TransportClient::Rustls(transport),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        })
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: Request<Bytes>) -> crate::Result<Response<Bytes>> {
        let method = request.method().clone();
        let redacted_uri = redact_uri(request.uri());
        let request = request.map(Full::new);

        let result = match &self.client {
            TransportClient::Plain(client) => client.request(request).await,
            #[cfg(feature = "tls-rustls-ring")]
            TransportClient::Rustls(client) => client.request(request).await,
        };
        let response = result.map_err(|source| Error::Transport {
            kind: transport_error_kind(&source),
            method: method.clone(),
            uri: redacted_uri.clone(),
            source: Box::new(source),
        })?;

        let (parts, body) = response.into_parts();
        let collected = Limited::new(body, self.max_response_body_bytes)
            .collect()
            .await
            .map_err(|source| {
                if source.is::<http_body_util::LengthLimitError>() {
                    Error::ResponseBodyTooLarge {
                        limit_bytes: self.max_response_body_bytes,
                        method: method.clone(),
                        uri: redacted_uri.clone(),
                    }
                } else {
                    Error::ReadBody { source }
                }
            })?;
        Ok(Response::from_parts(parts, collected.to_bytes()))
    }
}

/// Connect failures are flagged by the pool itself. Otherwise the source
/// chain is searched for a connection that went away mid-exchange.
fn transport_error_kind(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if error.is_connect() {
        return TransportErrorKind::Connect;
    }

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>()
            && (hyper_error.is_incomplete_message()
                || hyper_error.is_closed()
                || hyper_error.is_canceled())
        {
            return TransportErrorKind::Read;
        }
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>()
            && matches!(
                io_error.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            )
        {
            return TransportErrorKind::Read;
        }
        source = cause.source();
    }

    TransportErrorKind::Other
}

/// Sends one attempt of `pending` under its request timeout. The timeout
/// covers the whole exchange, body included.
pub(crate) async fn dispatch(
    transport: &dyn Transport,
    pending: &PendingRequest,
) -> crate::Result<crate::response::Response> {
    let request = pending.to_http_request()?;
    match timeout(pending.timeout(), transport.send(request)).await {
        Ok(result) => result.map(crate::response::Response::from_http),
        Err(_) => Err(Error::Timeout {
            timeout_ms: pending.timeout().as_millis(),
            method: pending.method().clone(),
            uri: pending.redacted_uri().to_owned(),
        }),
    }
}
