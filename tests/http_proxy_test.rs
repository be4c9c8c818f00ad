//! End-to-end tests: HTTP gate -> pipeline -> proxy -> stub upstreams.

mod common;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use common::{free_tcp_port, http_request, wait_until, Backend, CannedResponse};
use propylon::{Gateway, MemoryStore};

async fn start_gateway(config: &str) -> Gateway {
    let gateway = Gateway::from_yaml(config, Arc::new(MemoryStore::new()))
        .await
        .expect("gateway builds");
    gateway
        .wait_running(Duration::from_secs(5))
        .await
        .expect("gateway running");
    gateway
}

fn proxy_config(port: u16, backend_url: &str) -> String {
    format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
xForwardedFor: true
rules:
  - paths:
      - pathPrefix: /pipeline
        backend: pipeline-demo
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
filters:
  - kind: Proxy
    name: proxy
    pools:
      - servers:
          - url: {backend_url}
"#
    )
}

#[tokio::test]
async fn test_proxy_forwards_request_to_backend() {
    let t = test_report!("POST through the gate reaches the backend unchanged");
    let backend = Backend::spawn(CannedResponse::ok(b"backend says hi")).await;
    let port = free_tcp_port();
    let gateway = start_gateway(&proxy_config(port, &backend.url())).await;

    t.action("POST /pipeline with body 'hello gateway'");
    let response = http_request(
        port,
        "POST",
        "/pipeline",
        &[("x-custom", "kept")],
        b"hello gateway",
    )
    .await;

    t.assert_eq("status", &response.status, &200u16);
    t.assert_eq("body", &response.body_string().as_str(), &"backend says hi");

    let requests = backend.requests();
    t.assert_eq("backend saw one request", &requests.len(), &1usize);
    let seen = &requests[0];
    t.assert_eq("method", &seen.method.as_str(), &"POST");
    t.assert_eq("path", &seen.path.as_str(), &"/pipeline");
    t.assert_eq("body forwarded", &seen.body, &b"hello gateway".to_vec());
    t.assert_true(
        "custom header forwarded",
        seen.headers
            .iter()
            .any(|(k, v)| k == "x-custom" && v == "kept"),
    );
    t.assert_true(
        "hop-by-hop headers stripped",
        !seen.headers.iter().any(|(k, _)| k == "proxy-connection"),
    );
    t.assert_true(
        "client address appended to X-Forwarded-For",
        seen.headers
            .iter()
            .any(|(k, v)| k == "x-forwarded-for" && v.contains("127.0.0.1")),
    );

    gateway.close().await;
}

#[tokio::test]
async fn test_unmatched_route_is_404() {
    let t = test_report!("Requests outside the rules table get 404");
    let backend = Backend::spawn(CannedResponse::ok(b"x")).await;
    let port = free_tcp_port();
    let gateway = start_gateway(&proxy_config(port, &backend.url())).await;

    let response = http_request(port, "GET", "/elsewhere", &[], b"").await;
    t.assert_eq("status", &response.status, &404u16);
    t.assert_eq("backend untouched", &backend.request_count(), &0usize);

    gateway.close().await;
}

#[tokio::test]
async fn test_mock_filter_short_circuits() {
    let t = test_report!("Mock rule answers without touching any upstream");
    let port = free_tcp_port();
    let config = format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: mock-pipeline
---
kind: Pipeline
name: mock-pipeline
flow:
  - filter: mock
filters:
  - kind: Mock
    name: mock
    rules:
      - match:
          pathPrefix: /login/
        code: 202
        body: 'mocked body'
        headers:
          X-Test: test1
"#
    );
    let gateway = start_gateway(&config).await;

    let response = http_request(port, "GET", "/login/1", &[], b"").await;
    t.assert_eq("status", &response.status, &202u16);
    t.assert_eq("body", &response.body_string().as_str(), &"mocked body");
    t.assert_eq("header", &response.header("x-test"), &Some("test1"));

    gateway.close().await;
}

#[tokio::test]
async fn test_header_to_json_merges_before_proxy() {
    let t = test_report!("HeaderToJSON rewrites the body the backend receives");
    let backend = Backend::spawn(CannedResponse::ok(b"ok")).await;
    let port = free_tcp_port();
    let config = format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: enrich
---
kind: Pipeline
name: enrich
flow:
  - filter: header-to-json
  - filter: proxy
filters:
  - kind: HeaderToJSON
    name: header-to-json
    headerMap:
      - header: x-int
        json: int-value
        type: int
      - header: x-string
        json: string-value
      - header: x-bool
        json: bool-value
        type: bool
  - kind: Proxy
    name: proxy
    pools:
      - servers:
          - url: {backend_url}
"#,
        port = port,
        backend_url = backend.url(),
    );
    let gateway = start_gateway(&config).await;

    let response = http_request(
        port,
        "POST",
        "/",
        &[
            ("x-int", "123"),
            ("x-string", "string"),
            ("x-bool", "true"),
        ],
        br#"{"topic":"log","id":"abc123"}"#,
    )
    .await;
    t.assert_eq("status", &response.status, &200u16);

    let requests = backend.requests();
    t.assert_eq("one upstream call", &requests.len(), &1usize);
    let merged: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    t.assert_eq("topic kept", &merged["topic"].as_str(), &Some("log"));
    t.assert_eq("id kept", &merged["id"].as_str(), &Some("abc123"));
    t.assert_eq("int merged", &merged["int-value"].as_f64(), &Some(123.0));
    t.assert_eq(
        "string merged",
        &merged["string-value"].as_str(),
        &Some("string"),
    );
    t.assert_eq("bool merged", &merged["bool-value"].as_bool(), &Some(true));

    gateway.close().await;
}

fn compression_config(port: u16, backend_url: &str) -> String {
    format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: pipeline-demo
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
filters:
  - kind: Proxy
    name: proxy
    compression:
      minLength: 100
    pools:
      - servers:
          - url: {backend_url}
"#
    )
}

#[tokio::test]
async fn test_large_response_is_gzipped() {
    let t = test_report!("300-byte upstream response is gzipped for accepting clients");
    let payload = vec![b'a'; 300];
    let backend = Backend::spawn(CannedResponse::ok(&payload)).await;
    let port = free_tcp_port();
    let gateway = start_gateway(&compression_config(port, &backend.url())).await;

    let response = http_request(port, "GET", "/data", &[("accept-encoding", "gzip")], b"").await;
    t.assert_eq("status", &response.status, &200u16);
    t.assert_eq(
        "content-encoding",
        &response.header("content-encoding"),
        &Some("gzip"),
    );

    let mut decoder = flate2::read::GzDecoder::new(&response.body[..]);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).unwrap();
    t.assert_eq("gzip payload round-trips", &decoded, &payload);

    gateway.close().await;
}

#[tokio::test]
async fn test_small_response_is_not_gzipped() {
    let t = test_report!("50-byte upstream response stays identity-encoded");
    let payload = vec![b'b'; 50];
    let backend = Backend::spawn(CannedResponse::ok(&payload)).await;
    let port = free_tcp_port();
    let gateway = start_gateway(&compression_config(port, &backend.url())).await;

    let response = http_request(port, "GET", "/data", &[("accept-encoding", "gzip")], b"").await;
    t.assert_eq("status", &response.status, &200u16);
    t.assert_eq(
        "no content-encoding",
        &response.header("content-encoding"),
        &None::<&str>,
    );
    t.assert_eq("body untouched", &response.body, &payload);

    gateway.close().await;
}

#[tokio::test]
async fn test_candidate_pool_wins_on_match() {
    let t = test_report!("First matching candidate pool overrides main");
    let main_backend = Backend::spawn(CannedResponse::ok(b"main")).await;
    let canary_backend = Backend::spawn(CannedResponse::ok(b"canary")).await;
    let port = free_tcp_port();
    let config = format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: pipeline-demo
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
filters:
  - kind: Proxy
    name: proxy
    pools:
      - filter:
          headers:
            X-Canary:
              exact: "1"
        servers:
          - url: {canary_url}
      - servers:
          - url: {main_url}
"#,
        port = port,
        canary_url = canary_backend.url(),
        main_url = main_backend.url(),
    );
    let gateway = start_gateway(&config).await;

    let plain = http_request(port, "GET", "/x", &[], b"").await;
    t.assert_eq("main pool serves", &plain.body_string().as_str(), &"main");

    let canary = http_request(port, "GET", "/x", &[("x-canary", "1")], b"").await;
    t.assert_eq(
        "candidate pool serves",
        &canary.body_string().as_str(),
        &"canary",
    );

    gateway.close().await;
}

#[tokio::test]
async fn test_mirror_pool_receives_copy() {
    let t = test_report!("Mirror pool gets a fire-and-forget clone of the request");
    let main_backend = Backend::spawn(CannedResponse::ok(b"main")).await;
    let mirror_backend = Backend::spawn(CannedResponse::ok(b"mirror")).await;
    let port = free_tcp_port();
    let config = format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: pipeline-demo
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
filters:
  - kind: Proxy
    name: proxy
    mirrorPool:
      filter:
        urls:
          - url:
              prefix: /
      servers:
        - url: {mirror_url}
    pools:
      - servers:
          - url: {main_url}
"#,
        port = port,
        mirror_url = mirror_backend.url(),
        main_url = main_backend.url(),
    );
    let gateway = start_gateway(&config).await;

    let response = http_request(port, "POST", "/mirrored", &[], b"payload").await;
    t.assert_eq("primary response", &response.body_string().as_str(), &"main");

    let mirrored = wait_until(Duration::from_secs(2), || mirror_backend.request_count() == 1).await;
    t.assert_true("mirror backend saw the clone", mirrored);
    let mirror_requests = mirror_backend.requests();
    t.assert_eq(
        "mirror body matches",
        &mirror_requests[0].body,
        &b"payload".to_vec(),
    );

    gateway.close().await;
}

#[tokio::test]
async fn test_failure_codes_trigger_retry() {
    let t = test_report!("Configured failure codes retry up to maxAttempts");
    let backend = Backend::spawn(CannedResponse::status(503)).await;
    let port = free_tcp_port();
    let config = format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: pipeline-demo
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
resilience:
  - kind: Retry
    name: retry3
    maxAttempts: 3
    waitDuration: 10ms
filters:
  - kind: Proxy
    name: proxy
    pools:
      - retryPolicy: retry3
        failureCodes: [503]
        servers:
          - url: {backend_url}
"#,
        port = port,
        backend_url = backend.url(),
    );
    let gateway = start_gateway(&config).await;

    let response = http_request(port, "GET", "/x", &[], b"").await;
    t.assert_eq("client still sees the 503", &response.status, &503u16);
    t.assert_eq("three attempts made", &backend.request_count(), &3usize);

    gateway.close().await;
}

#[tokio::test]
async fn test_round_robin_distributes_evenly() {
    let t = test_report!("roundRobin over N healthy servers is exactly even per window");
    let a = Backend::spawn(CannedResponse::ok(b"a")).await;
    let b = Backend::spawn(CannedResponse::ok(b"b")).await;
    let port = free_tcp_port();
    let config = format!(
        r#"
kind: HTTPServer
name: edge
port: {port}
rules:
  - paths:
      - pathPrefix: /
        backend: pipeline-demo
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
filters:
  - kind: Proxy
    name: proxy
    pools:
      - loadBalance:
          policy: roundRobin
        servers:
          - url: {a_url}
          - url: {b_url}
"#,
        port = port,
        a_url = a.url(),
        b_url = b.url(),
    );
    let gateway = start_gateway(&config).await;

    for _ in 0..10 {
        let response = http_request(port, "GET", "/x", &[], b"").await;
        t.assert_eq("every request succeeds", &response.status, &200u16);
    }
    t.assert_eq("backend a share", &a.request_count(), &5usize);
    t.assert_eq("backend b share", &b.request_count(), &5usize);

    gateway.close().await;
}

#[tokio::test]
async fn test_unreachable_upstream_is_server_error() {
    let t = test_report!("Connection refused surfaces as a 5xx, not a hang");
    let port = free_tcp_port();
    let dead_port = free_tcp_port();
    let config = proxy_config(port, &format!("http://127.0.0.1:{}", dead_port));
    let gateway = start_gateway(&config).await;

    let response = http_request(port, "GET", "/pipeline", &[], b"").await;
    t.assert_eq("serverError maps to 503", &response.status, &503u16);

    gateway.close().await;
}
