use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::augment::authorize_headers;
use crate::client::{AuthClient, RequestExecutionOptions};
use crate::error::Error;
use crate::response::Response;
use crate::util::parse_header;

/// Position of a send within one original call. Produced fresh per replay,
/// never mutated in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempt(u8);

impl Attempt {
    pub const ORIGINAL: Self = Self(1);

    pub const fn number(self) -> u8 {
        self.0
    }

    pub const fn is_replay(self) -> bool {
        self.0 > 1
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::ORIGINAL
    }
}

/// Captured, replayable request. The `Authorization` header is owned by the
/// client and stripped on capture.
#[derive(Clone, Debug)]
pub(crate) struct PendingRequest {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
    attempt: Attempt,
    sent_with: Option<Arc<str>>,
}

impl PendingRequest {
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        redacted_uri: String,
        mut headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Self {
        headers.remove(AUTHORIZATION);
        Self {
            method,
            uri,
            redacted_uri,
            headers,
            body,
            timeout,
            attempt: Attempt::ORIGINAL,
            sent_with: None,
        }
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn redacted_uri(&self) -> &str {
        &self.redacted_uri
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn attempt(&self) -> Attempt {
        self.attempt
    }

    /// Access token the most recent send carried.
    pub(crate) fn sent_with(&self) -> Option<&str> {
        self.sent_with.as_deref()
    }

    pub(crate) fn with_token(mut self, access_token: Option<Arc<str>>) -> Self {
        self.sent_with = access_token;
        self
    }

    /// Descriptor for the single replay of this call, bound to `access_token`.
    pub(crate) fn into_replay(self, access_token: Arc<str>) -> Self {
        Self {
            attempt: self.attempt.next(),
            sent_with: Some(access_token),
            ..self
        }
    }

    pub(crate) fn to_http_request(&self) -> crate::Result<Request<Bytes>> {
        let headers = authorize_headers(&self.headers, self.sent_with.as_deref());
        let mut request_builder = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone());
        for (name, value) in &headers {
            request_builder = request_builder.header(name, value);
        }
        request_builder
            .body(self.body.clone())
            .map_err(|source| Error::RequestBuild { source })
    }
}

pub struct RequestBuilder<'a> {
    client: &'a AuthClient,
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl<'a> RequestBuilder<'a> {
    pub(crate) fn new(client: &'a AuthClient, method: Method, path: String) -> Self {
        Self {
            client,
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let (name, value) = parse_header(name, value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map_err(|source| Error::SerializeForm { source })?;
        Ok(self.body(encoded).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    pub async fn send(self) -> crate::Result<Response> {
        let execution_options = RequestExecutionOptions {
            request_timeout: self.timeout,
        };
        self.client
            .send_request(
                self.method,
                &self.path,
                &self.query_pairs,
                self.headers,
                self.body.unwrap_or_default(),
                execution_options,
            )
            .await
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send().await?;
        response.json()
    }
}
