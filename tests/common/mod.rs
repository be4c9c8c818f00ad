//! Test infrastructure for e2e gateway tests.
// Each integration test is a separate crate, so not every test uses every item here.
#![allow(dead_code)]

use std::fmt::{Debug, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// TestReport — structured test reporting
// ---------------------------------------------------------------------------

/// Auto-detect the test name from the calling function.
/// Must be called from the test function body (not a helper).
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        // Strip "::f" suffix
        let name = &name[..name.len() - 3];
        // In async fns, the path ends with "::{{closure}}" — strip that too
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::common::TestReport::new(name, $title, file!(), line!())
    }};
}

enum Step {
    Setup(String),
    Action(String),
    AssertPass(String),
    AssertFail(String),
}

impl Step {
    fn to_report_line(&self) -> String {
        match self {
            Step::Setup(msg) => format!("STEP setup: {}", msg),
            Step::Action(msg) => format!("STEP action: {}", msg),
            Step::AssertPass(msg) => format!("STEP assert_pass: {}", msg),
            Step::AssertFail(msg) => format!("STEP assert_fail: {}", msg),
        }
    }
}

pub struct TestReport {
    full_path: String,
    title: String,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
    source_file: String,
    source_line: u32,
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        let report_dir = std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from);
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            steps: Mutex::new(Vec::new()),
            report_dir,
            source_file: source_file.to_string(),
            source_line,
        }
    }

    pub fn setup(&self, msg: impl Display) {
        self.steps
            .lock()
            .unwrap()
            .push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.steps
            .lock()
            .unwrap()
            .push(Step::Action(msg.to_string()));
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        let msg = format!("{}: `{:?}` == `{:?}`", label, actual, expected);
        self.steps.lock().unwrap().push(if pass {
            Step::AssertPass(msg)
        } else {
            Step::AssertFail(msg.clone())
        });
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        let msg = format!("{}: `{}`", label, value);
        self.steps.lock().unwrap().push(if value {
            Step::AssertPass(msg)
        } else {
            Step::AssertFail(msg.clone())
        });
        assert!(value, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        let msg = format!("{}: {:?} contains {:?}", label, haystack, needle);
        self.steps.lock().unwrap().push(if pass {
            Step::AssertPass(msg)
        } else {
            Step::AssertFail(msg.clone())
        });
        assert!(
            pass,
            "{}: {:?} does not contain {:?}",
            label, haystack, needle
        );
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };
        let result = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };
        let steps = self.steps.lock().unwrap();
        let mut lines = Vec::new();
        lines.push(format!("NAME: {}", self.full_path));
        lines.push(format!("TITLE: {}", self.title));
        lines.push(format!("SOURCE: {}:{}", self.source_file, self.source_line));
        for step in steps.iter() {
            lines.push(step.to_report_line());
        }
        lines.push(format!("RESULT: {}", result));
        lines.push(String::new());

        let sanitized = self.full_path.replace("::", "__");
        let path = dir.join(format!("{}.txt", sanitized));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(path, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}

// ---------------------------------------------------------------------------
// Stub upstream backend
// ---------------------------------------------------------------------------

/// One request observed by a stub backend.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Canned response a stub backend serves.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn ok(body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// An HTTP/1.1 stub upstream capturing every request it serves.
pub struct Backend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response: Arc<Mutex<CannedResponse>>,
}

impl Backend {
    /// Spawn a stub backend on an ephemeral loopback port.
    pub async fn spawn(response: CannedResponse) -> Backend {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub backend");
        let addr = listener.local_addr().expect("backend addr");
        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let response = Arc::new(Mutex::new(response));

        let task_requests = requests.clone();
        let task_response = response.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let requests = task_requests.clone();
                let response = task_response.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let response = response.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|c| c.to_bytes().to_vec())
                                .unwrap_or_default();
                            requests.lock().unwrap().push(CapturedRequest {
                                method: parts.method.to_string(),
                                path: parts
                                    .uri
                                    .path_and_query()
                                    .map(|pq| pq.to_string())
                                    .unwrap_or_else(|| parts.uri.path().to_string()),
                                headers: parts
                                    .headers
                                    .iter()
                                    .map(|(k, v)| {
                                        (
                                            k.as_str().to_string(),
                                            v.to_str().unwrap_or("").to_string(),
                                        )
                                    })
                                    .collect(),
                                body,
                            });

                            let canned = response.lock().unwrap().clone();
                            let mut builder = Response::builder()
                                .status(StatusCode::from_u16(canned.status).unwrap());
                            for (k, v) in &canned.headers {
                                builder = builder.header(k, v);
                            }
                            builder.body(Full::new(Bytes::from(canned.body)))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Backend {
            addr,
            requests,
            response,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn set_response(&self, response: CannedResponse) {
        *self.response.lock().unwrap() = response;
    }
}

// ---------------------------------------------------------------------------
// Simple HTTP/1.1 test client
// ---------------------------------------------------------------------------

/// Response observed by [`http_request`].
#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Send one request to a gateway port over a fresh connection.
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> TestResponse {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to gateway");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(hyper::header::HOST, format!("127.0.0.1:{}", port));
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    let request = builder
        .body(Full::new(Bytes::from(body.to_vec())))
        .expect("build request");

    let response = sender.send_request(request).await.expect("send request");
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .expect("read response body")
        .to_bytes()
        .to_vec();
    TestResponse {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
        body,
    }
}

// ---------------------------------------------------------------------------
// Port helpers
// ---------------------------------------------------------------------------

/// Reserve an ephemeral TCP port and release it for the gate to claim.
pub fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("probe tcp port")
        .local_addr()
        .expect("probe addr")
        .port()
}

/// Reserve an ephemeral UDP port and release it for the gate to claim.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .expect("probe udp port")
        .local_addr()
        .expect("probe addr")
        .port()
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until<F>(timeout: std::time::Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}
