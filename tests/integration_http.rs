use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use authx::TransportErrorKind;
use authx::prelude::{
    AuthClient, AuthFailureReason, AuthObserver, Credential, CredentialStore, Error,
    MemoryCredentialStore, SessionEndReason,
};
use futures_util::future::join_all;
use serde_json::{Value, json};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    hang_up: bool,
}

impl MockResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into().into_bytes(),
            delay: Duration::ZERO,
            hang_up: false,
        }
    }

    /// Closes the connection after reading the request, without answering.
    fn hang_up() -> Self {
        let mut response = Self::new(200, "");
        response.hang_up = true;
        response
    }

    fn json(status: u16, body: Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response
            .headers
            .push(("Content-Type".to_owned(), "application/json".to_owned()));
        response
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn authorization(&self) -> Option<&str> {
        self.headers.get("authorization").map(String::as_str)
    }
}

type Handler = dyn Fn(&CapturedRequest) -> MockResponse + Send + Sync;

/// Serves every connection on its own thread and picks the response from the
/// request, so concurrent callers are not forced into a fixed order.
struct RoutingServer {
    base_url: String,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RoutingServer {
    fn start(handler: impl Fn(&CapturedRequest) -> MockResponse + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let handler: Arc<Handler> = Arc::new(handler);
        let captured = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let captured_clone = Arc::clone(&captured);
        let stop_clone = Arc::clone(&stop);

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut workers = Vec::new();

            while !stop_clone.load(Ordering::SeqCst) && Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let handler = Arc::clone(&handler);
                        let captured = Arc::clone(&captured_clone);
                        workers.push(thread::spawn(move || {
                            let _ = stream.set_nonblocking(false);
                            let Ok(request) = read_request(&mut stream) else {
                                return;
                            };
                            let response = handler(&request);
                            captured
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                            if response.hang_up {
                                return;
                            }
                            if !response.delay.is_zero() {
                                thread::sleep(response.delay);
                            }
                            let _ = write_response(&mut stream, &response);
                        }));
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }

            for worker in workers {
                let _ = worker.join();
            }
        });

        Self {
            base_url: format!("http://{address}"),
            captured,
            stop,
            join: Some(join),
        }
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn requests_to(&self, path: &str) -> Vec<CapturedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

impl Drop for RoutingServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Resource server that only accepts `Bearer <valid>`, plus a refresh
/// endpoint answering with `refresh`.
fn session_api(valid: &'static str, refresh: MockResponse) -> RoutingServer {
    RoutingServer::start(move |request| {
        if request.path == "/auth/refresh-token" {
            return refresh.clone();
        }
        let expected = format!("Bearer {valid}");
        if request.authorization() == Some(expected.as_str()) {
            MockResponse::json(200, json!({ "path": request.path, "ok": true }))
        } else {
            MockResponse::new(401, "token expired")
        }
    })
}

#[derive(Default)]
struct SessionEnds {
    reasons: Mutex<Vec<SessionEndReason>>,
}

impl AuthObserver for SessionEnds {
    fn on_session_ended(&self, reason: &SessionEndReason) {
        self.reasons
            .lock()
            .expect("lock session ends")
            .push(*reason);
    }
}

fn client_for(
    server: &RoutingServer,
    credential: Credential,
) -> (AuthClient, MemoryCredentialStore, Arc<SessionEnds>) {
    let store = MemoryCredentialStore::with_credential(credential);
    let session_ends = Arc::new(SessionEnds::default());
    let client = AuthClient::builder(&server.base_url)
        .client_name("authx-http-test")
        .request_timeout(Duration::from_secs(2))
        .refresh_timeout(Duration::from_secs(2))
        .try_default_header("x-client", "authx-http-test")
        .expect("valid default header")
        .credential_store(Arc::new(store.clone()))
        .observer(session_ends.clone())
        .try_build()
        .expect("client should build");
    (client, store, session_ends)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_token_refreshes_once_for_concurrent_requests() {
    let server = session_api(
        "new",
        MockResponse::json(200, json!({ "accessToken": "new" }))
            .delayed(Duration::from_millis(50)),
    );
    let (client, store, session_ends) = client_for(&server, Credential::new("old", "r1"));

    let calls = (0..5).map(|index| {
        let client = client.clone();
        async move {
            client
                .get(format!("/v1/items/{index}"))
                .send_json::<Value>()
                .await
        }
    });
    for (index, result) in join_all(calls).await.into_iter().enumerate() {
        let body = result.expect("request should succeed after refresh");
        assert_eq!(body["path"], format!("/v1/items/{index}"));
    }

    let refreshes = server.requests_to("/auth/refresh-token");
    assert_eq!(refreshes.len(), 1);
    let refresh = &refreshes[0];
    assert_eq!(refresh.method, "POST");
    assert_eq!(refresh.authorization(), None);
    assert_eq!(
        refresh.headers.get("x-client").map(String::as_str),
        Some("authx-http-test")
    );
    let payload: Value = serde_json::from_slice(&refresh.body).expect("refresh payload json");
    assert_eq!(payload, json!({ "refreshToken": "r1" }));

    let resource_requests: Vec<_> = server
        .requests()
        .into_iter()
        .filter(|request| request.path.starts_with("/v1/items/"))
        .collect();
    assert_eq!(resource_requests.len(), 10);
    for index in 0..5 {
        let path = format!("/v1/items/{index}");
        let sent: Vec<_> = resource_requests
            .iter()
            .filter(|request| request.path == path)
            .map(|request| request.authorization().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(sent.len(), 2, "{path} should be sent twice");
        assert!(sent.contains(&"Bearer old".to_owned()));
        assert!(sent.contains(&"Bearer new".to_owned()));
    }

    assert_eq!(store.access_token().as_deref(), Some("new"));
    assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    assert!(
        session_ends
            .reasons
            .lock()
            .expect("lock session ends")
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_refresh_ends_session_over_http() {
    let server = session_api("new", MockResponse::new(401, "refresh token revoked"));
    let (client, store, session_ends) = client_for(&server, Credential::new("old", "r1"));

    let error = client
        .get("/v1/me")
        .send()
        .await
        .expect_err("request should fail once refresh is rejected");
    match error {
        Error::AuthFailurePermanent { reason, .. } => {
            assert_eq!(reason, AuthFailureReason::RefreshRejected { status: 401 });
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(server.requests_to("/auth/refresh-token").len(), 1);
    assert_eq!(server.requests_to("/v1/me").len(), 1);
    assert!(store.snapshot().is_empty());
    assert_eq!(
        *session_ends.reasons.lock().expect("lock session ends"),
        vec![SessionEndReason::Unauthenticated(
            AuthFailureReason::RefreshRejected { status: 401 }
        )]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_refresh_payload_is_a_refresh_failure() {
    let server = session_api(
        "new",
        MockResponse::json(200, json!({ "token": "missing-access-token" })),
    );
    let (client, store, _session_ends) = client_for(&server, Credential::new("old", "r1"));

    let error = client
        .get("/v1/me")
        .send()
        .await
        .expect_err("request should fail on malformed refresh payload");
    assert!(matches!(
        error,
        Error::AuthFailurePermanent {
            reason: AuthFailureReason::RefreshInvalidResponse,
            ..
        }
    ));
    assert!(store.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_passes_through_without_refresh() {
    let server = RoutingServer::start(|_| MockResponse::new(500, "database unavailable"));
    let (client, store, _session_ends) = client_for(&server, Credential::new("old", "r1"));

    let error = client
        .post("/v1/orders")
        .json(&json!({ "sku": "A-1" }))
        .expect("serialize order")
        .send()
        .await
        .expect_err("500 should be returned to the caller");
    match error {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].authorization(), Some("Bearer old"));
    assert_eq!(store.snapshot(), Credential::new("old", "r1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_uses_configured_path() {
    let server = RoutingServer::start(|request| match request.path.as_str() {
        "/session/renew" => MockResponse::json(
            200,
            json!({ "accessToken": "new", "refreshToken": "r2" }),
        ),
        _ if request.authorization() == Some("Bearer new") => MockResponse::new(200, "ok"),
        _ => MockResponse::new(401, "expired"),
    });
    let store = MemoryCredentialStore::with_credential(Credential::new("old", "r1"));
    let client = AuthClient::builder(&server.base_url)
        .refresh_path("/session/renew")
        .persist_refreshed_token(false)
        .credential_store(Arc::new(store.clone()))
        .try_build()
        .expect("client should build");

    let response = client.get("/v1/me").send().await.expect("request succeeds");
    assert_eq!(response.text_lossy(), "ok");
    assert_eq!(store.snapshot(), Credential::new("new", "r2"));
    assert!(!store.is_persistent());
    assert_eq!(server.requests_to("/session/renew").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_response_body_reports_the_configured_limit() {
    let server = RoutingServer::start(|_| MockResponse::new(200, "x".repeat(64)));
    let client = AuthClient::builder(&server.base_url)
        .max_response_body_bytes(16)
        .credential_store(Arc::new(MemoryCredentialStore::with_credential(
            Credential::new("old", "r1"),
        )))
        .try_build()
        .expect("client should build");

    let error = client
        .get("/v1/export?token=abc")
        .send()
        .await
        .expect_err("body over the limit should fail");
    match &error {
        Error::ResponseBodyTooLarge {
            limit_bytes, uri, ..
        } => {
            assert_eq!(*limit_bytes, 16);
            assert!(uri.ends_with("/v1/export"), "query leaked into {uri}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        error.to_string(),
        format!(
            "response body exceeds 16 bytes for GET {}/v1/export",
            server.base_url
        )
    );
    assert!(server.requests_to("/auth/refresh-token").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_is_a_connect_error() {
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind unused port");
        listener.local_addr().expect("read local address")
    };
    let store = MemoryCredentialStore::with_credential(Credential::new("old", "r1"));
    let client = AuthClient::builder(format!("http://{address}"))
        .credential_store(Arc::new(store.clone()))
        .try_build()
        .expect("client should build");

    let error = client
        .get("/v1/me")
        .send()
        .await
        .expect_err("nothing listens on the port");
    assert!(
        matches!(
            error,
            Error::Transport {
                kind: TransportErrorKind::Connect,
                ..
            }
        ),
        "unexpected error: {error}"
    );
    assert_eq!(store.snapshot(), Credential::new("old", "r1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_closed_before_response_is_a_read_error() {
    let server = RoutingServer::start(|_| MockResponse::hang_up());
    let store = MemoryCredentialStore::with_credential(Credential::new("old", "r1"));
    let client = AuthClient::builder(&server.base_url)
        .credential_store(Arc::new(store.clone()))
        .try_build()
        .expect("client should build");

    let error = client
        .get("/v1/me")
        .send()
        .await
        .expect_err("server hung up");
    assert!(
        matches!(
            error,
            Error::Transport {
                kind: TransportErrorKind::Read,
                ..
            }
        ),
        "unexpected error: {error}"
    );
    assert_eq!(server.requests_to("/v1/me").len(), 1);
    assert!(server.requests_to("/auth/refresh-token").is_empty());
    assert_eq!(store.snapshot(), Credential::new("old", "r1"));
}
