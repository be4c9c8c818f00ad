//! Upstream server pools: balancing, health, caching, retry and dispatch.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::StatusCode;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::balance::{new_balancer, BalanceKey, Balancer, Server};
use super::compression::Compression;
use super::matcher::{RequestMatchSpec, RequestMatcher};
use super::transport::{Transport, UpstreamError, UpstreamResponse};
use super::{
    RESULT_CLIENT_ERROR, RESULT_FAILURE_CODE, RESULT_SERVER_ERROR, RESULT_SHORT_CIRCUITED,
    RESULT_TIMEOUT,
};
use crate::context::{Context, Request};
use crate::error::{Error, Result};
use crate::filters::FilterSpec;
use crate::resilience::{CircuitBreaker, ResiliencePolicy, RetryPolicy};
use crate::spec::{parse_duration, HealthCheckSpec, LoadBalanceSpec, ServerSpec};
use crate::stat::{TrafficStat, TrafficStatus};

/// Spec of one pool inside a proxy filter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerPoolSpec {
    /// Candidate/mirror match expression; the pool without one is main.
    #[serde(default)]
    pub filter: Option<RequestMatchSpec>,

    pub servers: Vec<ServerSpec>,

    #[serde(default)]
    pub load_balance: LoadBalanceSpec,

    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,

    /// Per-attempt upstream timeout, e.g. `30s`.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Name of a `Retry` resilience policy from the pipeline spec.
    #[serde(default)]
    pub retry_policy: Option<String>,

    /// Name of a `CircuitBreaker` resilience policy from the pipeline spec.
    #[serde(default)]
    pub circuit_breaker_policy: Option<String>,

    #[serde(default)]
    pub memory_cache: Option<MemoryCacheSpec>,

    /// Response codes treated as upstream failures for retry purposes.
    #[serde(default)]
    pub failure_codes: Vec<u16>,
}

impl ServerPoolSpec {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::spec("pool needs at least one server"));
        }
        self.load_balance.validate()?;
        let zero = self.servers.iter().filter(|s| s.weight == 0).count();
        if zero != 0 && zero != self.servers.len() {
            return Err(Error::spec(
                "server weights must be all zero or all positive",
            ));
        }
        if let Some(t) = &self.timeout {
            parse_duration(t)?;
        }
        if let Some(hc) = &self.health_check {
            parse_duration(&hc.interval)?;
            parse_duration(&hc.timeout)?;
        }
        if let Some(mc) = &self.memory_cache {
            mc.validate()?;
        }
        Ok(())
    }
}

/// Memory cache settings of a pool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MemoryCacheSpec {
    #[serde(default = "default_expiration")]
    pub expiration: String,

    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,

    #[serde(default = "default_cache_size")]
    pub size: usize,

    #[serde(default = "default_cache_codes")]
    pub codes: Vec<u16>,

    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,

    /// Headers folded into the cache fingerprint.
    #[serde(default)]
    pub headers: Vec<String>,
}

fn default_expiration() -> String {
    "10s".to_string()
}

fn default_max_entry_bytes() -> usize {
    4096
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_codes() -> Vec<u16> {
    vec![200]
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

impl MemoryCacheSpec {
    fn validate(&self) -> Result<()> {
        parse_duration(&self.expiration)?;
        if self.size == 0 {
            return Err(Error::spec("memoryCache size must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at: Instant,
}

struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    max_entry_bytes: usize,
    codes: HashSet<u16>,
    methods: HashSet<String>,
    key_headers: Vec<String>,
}

impl MemoryCache {
    fn new(spec: &MemoryCacheSpec) -> Result<Self> {
        let size = NonZeroUsize::new(spec.size)
            .ok_or_else(|| Error::spec("memoryCache size must be non-zero"))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(size)),
            ttl: parse_duration(&spec.expiration)?,
            max_entry_bytes: spec.max_entry_bytes,
            codes: spec.codes.iter().copied().collect(),
            methods: spec.methods.iter().map(|m| m.to_uppercase()).collect(),
            key_headers: spec.headers.clone(),
        })
    }

    fn key(&self, req: &Request) -> String {
        let mut key = format!(
            "{} {}{}",
            req.method,
            req.path(),
            req.query().map(|q| format!("?{}", q)).unwrap_or_default()
        );
        for header in &self.key_headers {
            key.push('\n');
            key.push_str(header);
            key.push('=');
            key.push_str(req.header(header).unwrap_or(""));
        }
        key
    }

    fn load(&self, req: &Request) -> Option<CacheEntry> {
        if !self.methods.contains(req.method.as_str()) {
            return None;
        }
        let key = self.key(req);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.get(&key)?;
        if entry.stored_at.elapsed() > self.ttl {
            entries.pop(&key);
            return None;
        }
        Some(entry.clone())
    }

    fn store(&self, req: &Request, status: StatusCode, headers: &HeaderMap, body: &Bytes) {
        if !self.methods.contains(req.method.as_str()) {
            return;
        }
        if !self.codes.contains(&status.as_u16()) {
            return;
        }
        if body.len() > self.max_entry_bytes {
            return;
        }
        let entry = CacheEntry {
            status,
            headers: headers.clone(),
            body: body.clone(),
            stored_at: Instant::now(),
        };
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .put(self.key(req), entry);
    }
}

/// Status snapshot of a pool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPoolStatus {
    pub name: String,
    pub stat: TrafficStatus,
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub url: String,
    pub healthy: bool,
}

/// A realised pool: servers, policy objects and the shared transport.
pub struct ServerPool {
    name: String,
    servers: RwLock<Arc<Vec<Arc<Server>>>>,
    balancer: Box<dyn Balancer>,
    header_hash_key: Option<String>,
    pub(super) matcher: Option<RequestMatcher>,
    timeout: Option<Duration>,
    retry: Option<Arc<RetryPolicy>>,
    breaker: Option<Arc<CircuitBreaker>>,
    cache: Option<MemoryCache>,
    failure_codes: HashSet<u16>,
    compression: Option<Arc<Compression>>,
    server_max_body_size: u64,
    transport: Arc<Transport>,
    stat: TrafficStat,
    probe_cancel: CancellationToken,
}

impl ServerPool {
    pub fn new(
        name: String,
        spec: &ServerPoolSpec,
        filter_spec: &FilterSpec,
        transport: Arc<Transport>,
        compression: Option<Arc<Compression>>,
        server_max_body_size: u64,
    ) -> Result<Arc<Self>> {
        spec.validate()?;

        let servers = spec
            .servers
            .iter()
            .map(|s| Server::new(s).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let servers = Arc::new(servers);

        let matcher = spec
            .filter
            .as_ref()
            .map(RequestMatcher::compile)
            .transpose()?;

        let retry = match &spec.retry_policy {
            None => None,
            Some(policy_name) => match filter_spec.resilience_policy(policy_name) {
                Some(ResiliencePolicy::Retry(p)) => Some(p.clone()),
                _ => {
                    return Err(Error::spec(format!(
                        "pool {}: unknown retry policy {:?}",
                        name, policy_name
                    )))
                }
            },
        };
        let breaker = match &spec.circuit_breaker_policy {
            None => None,
            Some(policy_name) => match filter_spec.resilience_policy(policy_name) {
                Some(ResiliencePolicy::CircuitBreaker(p)) => Some(p.clone()),
                _ => {
                    return Err(Error::spec(format!(
                        "pool {}: unknown circuit breaker policy {:?}",
                        name, policy_name
                    )))
                }
            },
        };

        let cache = spec.memory_cache.as_ref().map(MemoryCache::new).transpose()?;

        let probe_cancel = CancellationToken::new();
        if let Some(hc) = &spec.health_check {
            spawn_health_probe(
                name.clone(),
                hc.clone(),
                servers.clone(),
                transport.clone(),
                probe_cancel.clone(),
            )?;
        }

        Ok(Arc::new(Self {
            name,
            servers: RwLock::new(servers),
            balancer: new_balancer(&spec.load_balance)?,
            header_hash_key: spec.load_balance.header_hash_key.clone(),
            matcher,
            timeout: spec.timeout.as_deref().map(parse_duration).transpose()?,
            retry,
            breaker,
            cache,
            failure_codes: spec.failure_codes.iter().copied().collect(),
            compression,
            server_max_body_size,
            transport,
            stat: TrafficStat::new(),
            probe_cancel,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ServerPoolStatus {
        let servers = self.servers.read().expect("servers lock poisoned").clone();
        ServerPoolStatus {
            name: self.name.clone(),
            stat: self.stat.status(),
            servers: servers
                .iter()
                .map(|s| ServerStatus {
                    url: s.url.clone(),
                    healthy: s.healthy(),
                })
                .collect(),
        }
    }

    /// Stop background probes. Idempotent.
    pub fn close(&self) {
        self.probe_cancel.cancel();
    }

    fn pick_server(&self, req: &Request) -> Option<Arc<Server>> {
        let servers = self.servers.read().expect("servers lock poisoned").clone();
        let healthy: Vec<Arc<Server>> = servers.iter().filter(|s| s.healthy()).cloned().collect();
        let key = BalanceKey {
            client_ip: req.client_addr.map(|a| a.ip()),
            header: self
                .header_hash_key
                .as_deref()
                .and_then(|name| req.header(name)),
        };
        self.balancer.select(&healthy, &key).cloned()
    }

    /// Effective deadline of one attempt.
    fn attempt_deadline(&self, ctx: &Context) -> Option<Duration> {
        match (self.timeout, ctx.remaining()) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (Some(t), None) => Some(t),
            (None, r) => r,
        }
    }

    /// Drive one request against the pool, writing the upstream response
    /// into the context. Returns the proxy result string.
    pub async fn handle(&self, ctx: &mut Context) -> String {
        let started = Instant::now();
        let result = self.dispatch(ctx).await;
        self.stat.record(started.elapsed(), !result.is_empty());
        if !result.is_empty() {
            ctx.add_tag(format!("pool {}: {}", self.name, result));
        }
        result
    }

    async fn dispatch(&self, ctx: &mut Context) -> String {
        if self.server_max_body_size > 0
            && ctx.request().body().len() as u64 > self.server_max_body_size
        {
            return RESULT_CLIENT_ERROR.to_string();
        }

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.load(ctx.request()) {
                let resp = ctx.response_mut();
                resp.status = entry.status;
                resp.headers = entry.headers;
                resp.set_body(entry.body);
                return String::new();
            }
        }

        if let Some(breaker) = &self.breaker {
            if !breaker.allow() {
                return RESULT_SHORT_CIRCUITED.to_string();
            }
        }

        let max_attempts = self.retry.as_ref().map(|r| r.max_attempts()).unwrap_or(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if ctx.is_cancelled() {
                return RESULT_TIMEOUT.to_string();
            }

            let Some(server) = self.pick_server(ctx.request()) else {
                tracing::warn!(pool = %self.name, "no healthy server available");
                self.record_failure();
                return RESULT_SERVER_ERROR.to_string();
            };

            let deadline = self.attempt_deadline(ctx);
            let sent = self.transport.send(&server, ctx.request(), deadline).await;
            match sent {
                Ok(response) => {
                    let is_failure_code = self.failure_codes.contains(&response.status.as_u16());
                    if is_failure_code && attempt < max_attempts {
                        self.backoff(attempt).await;
                        continue;
                    }

                    self.write_response(ctx, &response);
                    if is_failure_code {
                        self.record_failure();
                        return RESULT_FAILURE_CODE.to_string();
                    }
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    if let Some(cache) = &self.cache {
                        cache.store(
                            ctx.request(),
                            response.status,
                            &response.headers,
                            &response.body,
                        );
                    }
                    return String::new();
                }
                Err(UpstreamError::Timeout) => {
                    tracing::warn!(pool = %self.name, server = %server.url, "upstream timed out");
                    self.record_failure();
                    return RESULT_TIMEOUT.to_string();
                }
                Err(UpstreamError::Network(err)) => {
                    tracing::warn!(
                        pool = %self.name,
                        server = %server.url,
                        error = %err,
                        "upstream request failed"
                    );
                    if attempt < max_attempts {
                        self.backoff(attempt).await;
                        continue;
                    }
                    self.record_failure();
                    return RESULT_SERVER_ERROR.to_string();
                }
            }
        }
    }

    fn write_response(&self, ctx: &mut Context, upstream: &UpstreamResponse) {
        let request_headers = ctx.request().headers.clone();
        let resp = ctx.response_mut();
        resp.status = upstream.status;
        resp.headers = upstream.headers.clone();
        resp.set_body(upstream.body.clone());
        if let Some(compression) = &self.compression {
            compression.apply(&request_headers, resp);
        }
    }

    fn record_failure(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.record_failure();
        }
    }

    async fn backoff(&self, attempt: u32) {
        if let Some(retry) = &self.retry {
            tokio::time::sleep(retry.backoff(attempt)).await;
        }
    }

    /// Dispatch a cloned request and discard the response.
    pub async fn handle_mirror(&self, req: Request) {
        let Some(server) = self.pick_server(&req) else {
            tracing::debug!(pool = %self.name, "mirror: no healthy server");
            return;
        };
        let deadline = self.timeout;
        if let Err(e) = self.transport.send(&server, &req, deadline).await {
            tracing::debug!(pool = %self.name, error = ?e, "mirror request failed");
        }
    }
}

fn spawn_health_probe(
    pool: String,
    spec: HealthCheckSpec,
    servers: Arc<Vec<Arc<Server>>>,
    transport: Arc<Transport>,
    cancel: CancellationToken,
) -> Result<()> {
    let interval = parse_duration(&spec.interval)?;
    let timeout = parse_duration(&spec.timeout)?;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for server in servers.iter() {
                let healthy = match &spec.path {
                    None => transport.probe_connect(server, timeout).await,
                    Some(path) => transport.probe_http(server, path, timeout).await,
                };
                if healthy {
                    server.probe_passed(spec.passes);
                } else {
                    server.probe_failed(spec.fails);
                }
            }
            tracing::trace!(pool = %pool, "health probe round finished");
        }
    });
    Ok(())
}
