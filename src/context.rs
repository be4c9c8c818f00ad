//! Per-request state shared by the filters of a pipeline.
//!
//! A `Context` owns the inbound request, the response being assembled, a
//! tag/attribute map visible to downstream filters, the deadline and
//! cancellation signal, and the chain cursor behind `call_next_handler`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::filters::Filter;

/// Protocol tag of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Mqtt,
    L4,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Mqtt => f.write_str("mqtt"),
            Protocol::L4 => f.write_str("l4"),
        }
    }
}

/// Buffered inbound HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    body: Bytes,
    pub client_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: None,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Host from the `Host` header, falling back to the URI authority.
    pub fn host(&self) -> Option<String> {
        if let Some(v) = self.headers.get(hyper::header::HOST) {
            if let Ok(s) = v.to_str() {
                return Some(s.to_string());
            }
        }
        self.uri.authority().map(|a| a.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }
}

/// The response a pipeline assembles for the client.
#[derive(Debug, Clone)]
pub struct ResponseEntity {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Default for ResponseEntity {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

impl ResponseEntity {
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }
}

/// Timing and result of one filter activation.
#[derive(Debug, Clone)]
pub struct FilterRecord {
    pub name: String,
    pub result: String,
    pub elapsed: Duration,
}

/// One resolved entry of a pipeline flow.
#[derive(Debug, Clone)]
pub(crate) struct ChainEntry {
    pub name: String,
    pub filter: Arc<dyn Filter>,
    /// result string -> flow index to jump to.
    pub jumps: HashMap<String, usize>,
    /// Declared result set of the filter kind.
    pub results: Vec<String>,
}

/// Cursor over the remaining pipeline flow.
pub(crate) struct Chain {
    pub entries: Arc<Vec<ChainEntry>>,
    /// Index of the next entry to invoke.
    pub next: usize,
}

/// Per-request context threaded through a pipeline.
pub struct Context {
    pub protocol: Protocol,
    request: Request,
    response: ResponseEntity,
    tags: Vec<String>,
    attrs: HashMap<String, String>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    records: Vec<FilterRecord>,
    pub(crate) chain: Option<Chain>,
}

impl Context {
    pub fn new(protocol: Protocol, request: Request) -> Self {
        Self {
            protocol,
            request,
            response: ResponseEntity::default(),
            tags: Vec::new(),
            attrs: HashMap::new(),
            deadline: None,
            cancel: CancellationToken::new(),
            records: Vec::new(),
            chain: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &ResponseEntity {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseEntity {
        &mut self.response
    }

    /// Add a log tag visible to downstream filters and access logs.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(|s| s.as_str())
    }

    /// Arm the context deadline `timeout` from now.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remaining time before the deadline, `None` when no deadline is armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self.remaining().is_some_and(|r| r.is_zero())
    }

    pub fn filter_records(&self) -> &[FilterRecord] {
        &self.records
    }

    /// Invoke the next filter in the pipeline flow.
    ///
    /// The previous filter's `last_result` steers advancement: an empty
    /// result moves to the next flow entry, a result with a jump entry moves
    /// to its target, and any other non-empty result terminates the chain and
    /// becomes the return value. Consumes the chain cursor, so a second call
    /// within one activation returns `last_result` unchanged.
    pub fn call_next_handler(&mut self, last_result: String) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let mut chain = match self.chain.take() {
                Some(chain) => chain,
                None => return last_result,
            };
            let entries = chain.entries.clone();

            if chain.next > 0 && !last_result.is_empty() {
                let prev = &entries[chain.next - 1];
                match prev.jumps.get(&last_result) {
                    Some(&target) => chain.next = target,
                    None => return last_result,
                }
            }

            if chain.next >= entries.len() {
                return String::new();
            }

            let index = chain.next;
            chain.next = index + 1;
            self.chain = Some(chain);

            let entry = &entries[index];
            let filter = entry.filter.clone();
            let started = Instant::now();
            let result = filter.handle(self).await;
            let elapsed = started.elapsed();

            if !result.is_empty() && !entry.results.iter().any(|r| r == &result) {
                tracing::error!(
                    filter = %entry.name,
                    result = %result,
                    "BUG: filter returned an undeclared result"
                );
            }

            self.records.push(FilterRecord {
                name: entry.name.clone(),
                result: result.clone(),
                elapsed,
            });
            result
        })
    }
}
