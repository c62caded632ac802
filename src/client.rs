use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use tracing::{Instrument, Span, debug, info, info_span, warn};
use url::Url;

use crate::classify::{
    Classification, classify, default_auth_failure_statuses, pass_through,
};
use crate::config::{AuthClientConfig, DEFAULT_CLIENT_NAME, DEFAULT_REQUEST_TIMEOUT};
use crate::coordinator::{
    DEFAULT_REFRESH_TIMEOUT, RefreshCoordinator, RefreshCoordinatorOptions, RefreshOutcome,
};
use crate::credentials::{Credential, CredentialStore, MemoryCredentialStore};
use crate::error::{AuthFailureReason, Error};
use crate::metrics::{AuthMetrics, AuthMetricsSnapshot};
use crate::observe::{AuthObserver, Observers};
use crate::refresh::{DEFAULT_REFRESH_PATH, HttpRefreshEndpoint, RefreshEndpoint};
use crate::replay::ReplayExecutor;
use crate::request::{PendingRequest, RequestBuilder};
use crate::response::Response;
use crate::session::{SessionEndReason, SessionTerminator};
use crate::transport::{DEFAULT_MAX_RESPONSE_BODY_BYTES, HyperTransport, Transport, dispatch};
use crate::util::{
    merge_headers, parse_base_url, parse_header, redact_uri, request_url, to_http_uri,
};

pub(crate) struct RequestExecutionOptions {
    pub(crate) request_timeout: Option<Duration>,
}

pub struct AuthClientBuilder {
    base_url: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    refresh_timeout: Duration,
    refresh_path: String,
    persist_refreshed_token: bool,
    max_response_body_bytes: usize,
    auth_failure_statuses: BTreeSet<u16>,
    client_name: String,
    credential_store: Option<Arc<dyn CredentialStore>>,
    transport: Option<Arc<dyn Transport>>,
    refresh_endpoint: Option<Arc<dyn RefreshEndpoint>>,
    observers: Vec<Arc<dyn AuthObserver>>,
}

impl AuthClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            persist_refreshed_token: true,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            auth_failure_statuses: default_auth_failure_statuses(),
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            credential_store: None,
            transport: None,
            refresh_endpoint: None,
            observers: Vec::new(),
        }
    }

    pub fn config(self, config: AuthClientConfig) -> Self {
        let request_timeout = config.request_timeout();
        let refresh_timeout = config.refresh_timeout();
        self.client_name(config.client_name)
            .request_timeout(request_timeout)
            .refresh_timeout(refresh_timeout)
            .refresh_path(config.refresh_path)
            .persist_refreshed_token(config.persist_refreshed_token)
            .max_response_body_bytes(config.max_response_body_bytes)
            .auth_failure_statuses(config.auth_failure_statuses)
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let (name, value) = parse_header(name, value)?;
        Ok(self.default_header(name, value))
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    /// Timeout for the refresh call alone, independent of `request_timeout`.
    pub fn refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn refresh_path(mut self, refresh_path: impl Into<String>) -> Self {
        self.refresh_path = refresh_path.into();
        self
    }

    pub fn persist_refreshed_token(mut self, persist: bool) -> Self {
        self.persist_refreshed_token = persist;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    /// Replaces the statuses treated as an expired access token. An empty
    /// set keeps the default of 401.
    pub fn auth_failure_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        let statuses: BTreeSet<u16> = statuses.into_iter().collect();
        self.auth_failure_statuses = if statuses.is_empty() {
            default_auth_failure_statuses()
        } else {
            statuses
        };
        self
    }

    pub fn auth_failure_status(mut self, status: u16) -> Self {
        self.auth_failure_statuses.insert(status);
        self
    }

    pub fn credential_store(mut self, credential_store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(credential_store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the default `POST <base><refresh_path>` endpoint.
    pub fn refresh_endpoint(mut self, refresh_endpoint: Arc<dyn RefreshEndpoint>) -> Self {
        self.refresh_endpoint = Some(refresh_endpoint);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn AuthObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn try_build(self) -> crate::Result<AuthClient> {
        let base_url = parse_base_url(&self.base_url)?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HyperTransport::new()?.max_response_body_bytes(self.max_response_body_bytes),
            ),
        };
        let store: Arc<dyn CredentialStore> = match self.credential_store {
            Some(store) => store,
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let endpoint: Arc<dyn RefreshEndpoint> = match self.refresh_endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(
                HttpRefreshEndpoint::new(
                    Arc::clone(&transport),
                    &self.base_url,
                    &self.refresh_path,
                )?
                .with_default_headers(&self.default_headers),
            ),
        };

        let metrics = AuthMetrics::default();
        let observers = Observers::new(self.observers);
        let terminator = Arc::new(SessionTerminator::new(
            Arc::clone(&store),
            observers.clone(),
            metrics.clone(),
        ));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            endpoint,
            Arc::clone(&terminator),
            metrics.clone(),
            observers.clone(),
            RefreshCoordinatorOptions {
                client_name: self.client_name.clone(),
                refresh_timeout: self.refresh_timeout,
                persist_refreshed_token: self.persist_refreshed_token,
            },
        );

        Ok(AuthClient {
            base_url,
            default_headers: self.default_headers,
            request_timeout: self.request_timeout,
            auth_failure_statuses: Arc::new(self.auth_failure_statuses),
            client_name: self.client_name,
            transport,
            store,
            coordinator,
            terminator,
            metrics,
            observers,
        })
    }

    pub fn build(self) -> AuthClient {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build authx client: {error}"))
    }
}

/// HTTP client that attaches bearer tokens and transparently refreshes and
/// replays on authorization failure.
///
/// Cloning is cheap; clones share credentials and refresh state.
#[derive(Clone)]
pub struct AuthClient {
    base_url: Url,
    default_headers: HeaderMap,
    request_timeout: Duration,
    auth_failure_statuses: Arc<BTreeSet<u16>>,
    client_name: String,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    coordinator: RefreshCoordinator,
    terminator: Arc<SessionTerminator>,
    metrics: AuthMetrics,
    observers: Observers,
}

impl AuthClient {
    pub fn builder(base_url: impl Into<String>) -> AuthClientBuilder {
        AuthClientBuilder::new(base_url)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn metrics_snapshot(&self) -> AuthMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn credential(&self) -> Credential {
        Credential {
            access_token: self.store.access_token(),
            refresh_token: self.store.refresh_token(),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }

    pub fn is_session_ended(&self) -> bool {
        self.terminator.is_ended()
    }

    /// Stores credentials produced by a login and starts a new session.
    ///
    /// A refresh still in flight for the previous session is cancelled so
    /// its result cannot overwrite the new tokens.
    pub fn establish_session(&self, access_token: &str, refresh_token: &str, persistent: bool) {
        self.coordinator.cancel();
        self.store.set_access_token(access_token, persistent);
        self.store.set_refresh_token(refresh_token, persistent);
        self.terminator.rearm();
        info!(client = %self.client_name, "session established");
    }

    /// Ends the session: pending waiters get [`Error::RefreshCancelled`],
    /// credentials are cleared and the session-ended signal fires once.
    pub fn logout(&self) {
        let released = self.coordinator.cancel();
        debug!(client = %self.client_name, released, "logging out");
        self.terminator.terminate(SessionEndReason::Logout);
    }

    /// Teardown without logout: pending waiters get
    /// [`Error::RefreshCancelled`] and credentials are left untouched.
    pub fn shutdown(&self) -> usize {
        self.coordinator.cancel()
    }

    pub(crate) async fn send_request(
        &self,
        method: Method,
        path: &str,
        query_pairs: &[(String, String)],
        headers: HeaderMap,
        body: Bytes,
        execution_options: RequestExecutionOptions,
    ) -> crate::Result<Response> {
        let uri = to_http_uri(&request_url(&self.base_url, path, query_pairs)?)?;
        let redacted_uri = redact_uri(&uri);
        let merged_headers = merge_headers(&self.default_headers, headers);
        let request_timeout = execution_options
            .request_timeout
            .unwrap_or(self.request_timeout)
            .max(Duration::from_millis(1));
        let pending = PendingRequest::new(
            method.clone(),
            uri,
            redacted_uri.clone(),
            merged_headers,
            body,
            request_timeout,
        );

        self.metrics.record_request_started();
        let _in_flight = self.metrics.enter_in_flight();
        let span = info_span!(
            "authx.request",
            client = %self.client_name,
            method = %method,
            uri = %redacted_uri,
            attempt = tracing::field::Empty
        );
        let result = self.execute(pending).instrument(span).await;
        self.metrics.record_request_completed(&result);
        result
    }

    async fn execute(&self, pending: PendingRequest) -> crate::Result<Response> {
        let pending = pending.with_token(self.store.access_token().map(Arc::from));
        Span::current().record("attempt", pending.attempt().number());
        debug!(
            authorized = pending.sent_with().is_some(),
            "sending request"
        );

        let outcome = dispatch(self.transport.as_ref(), &pending).await;
        match classify(&outcome, pending.attempt(), &self.auth_failure_statuses) {
            Classification::Success | Classification::OtherFailure => {
                pass_through(outcome, pending.method(), pending.redacted_uri())
            }
            Classification::AuthExpired => self.recover(pending).await,
            Classification::AuthFailurePermanent => Err(self
                .replay_executor()
                .end_session(&pending, AuthFailureReason::ReplayUnauthorized)),
        }
    }

    async fn recover(&self, pending: PendingRequest) -> crate::Result<Response> {
        debug!("access token rejected; waiting for refreshed token");
        let receiver = self.coordinator.coordinate(pending.sent_with());
        let outcome = receiver.await.unwrap_or(RefreshOutcome::Cancelled);

        match outcome {
            RefreshOutcome::Refreshed(access_token) => {
                self.replay_executor().replay(pending, access_token).await
            }
            RefreshOutcome::Failed(reason) => Err(Error::AuthFailurePermanent {
                reason,
                method: pending.method().clone(),
                uri: pending.redacted_uri().to_owned(),
            }),
            RefreshOutcome::Cancelled => {
                warn!("token refresh cancelled before the request could be replayed");
                Err(Error::RefreshCancelled {
                    method: pending.method().clone(),
                    uri: pending.redacted_uri().to_owned(),
                })
            }
        }
    }

    fn replay_executor(&self) -> ReplayExecutor<'_> {
        ReplayExecutor {
            transport: self.transport.as_ref(),
            auth_failure_statuses: &self.auth_failure_statuses,
            terminator: &self.terminator,
            metrics: &self.metrics,
            observers: &self.observers,
        }
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthClient")
            .field("base_url", &self.base_url.as_str())
            .field("client_name", &self.client_name)
            .field("request_timeout", &self.request_timeout)
            .field("auth_failure_statuses", &self.auth_failure_statuses)
            .finish_non_exhaustive()
    }
}
