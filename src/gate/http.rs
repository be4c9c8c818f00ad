//! HTTP traffic gate: listener lifecycle FSM, TLS, routing and hot reload.
//!
//! The runtime is a task consuming an event channel (`reload`,
//! `serveFailed`, `close`) plus a periodic failed-state retry tick. State
//! transitions: nil/closed + reload -> running; running + incompatible
//! reload -> restart; running + serveFailed -> failed; failed + tick ->
//! start; any + close -> closed.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::limit::LimitListener;
use super::mux::{Mux, RouteResult};
use crate::context::{Context, Protocol, Request};
use crate::error::{Error, Result};
use crate::registry::PipelineMap;
use crate::spec::HttpServerSpec;
use crate::stat::{TrafficStat, TrafficStatus};

const CHECK_FAILED_INTERVAL: Duration = Duration::from_secs(10);
const GRACE_WINDOW: Duration = Duration::from_secs(30);

/// Runtime state of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Nil,
    Running,
    Failed,
    Closed,
}

/// Status snapshot of a gate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStatus {
    pub name: String,
    pub state: GateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stat: TrafficStatus,
}

enum Event {
    Reload(Box<HttpServerSpec>),
    ServeFailed { start_num: u64, error: String },
    Close(oneshot::Sender<()>),
}

/// The HTTP traffic gate object.
pub struct HttpServer {
    name: String,
    event_tx: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<(GateState, Option<String>)>,
    stat: Arc<TrafficStat>,
}

impl HttpServer {
    /// Create the gate and start its runtime. The listener comes up
    /// asynchronously; use [`HttpServer::wait_for`] to observe the outcome.
    pub fn new(spec: HttpServerSpec, pipelines: PipelineMap) -> Result<Self> {
        spec.validate()?;
        let name = spec.name.clone();
        let mux = Arc::new(Mux::new(&spec)?);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel((GateState::Nil, None));
        let stat = Arc::new(TrafficStat::new());

        let runtime = Runtime {
            name: name.clone(),
            spec: None,
            mux,
            pipelines,
            stat: stat.clone(),
            start_num: 0,
            server: None,
            state_tx,
            event_tx: event_tx.clone(),
        };
        tokio::spawn(runtime.run(event_rx));

        let gate = Self {
            name,
            event_tx,
            state_rx,
            stat,
        };
        gate.send(Event::Reload(Box::new(spec)))?;
        Ok(gate)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply a new spec generation without dropping compatible connections.
    pub fn reload(&self, spec: HttpServerSpec) -> Result<()> {
        spec.validate()?;
        self.send(Event::Reload(Box::new(spec)))
    }

    pub fn state(&self) -> GateState {
        self.state_rx.borrow().0
    }

    pub fn status(&self) -> GateStatus {
        let (state, error) = self.state_rx.borrow().clone();
        GateStatus {
            name: self.name.clone(),
            state,
            error,
            stat: self.stat.status(),
        }
    }

    /// Wait until the gate reaches `state`.
    pub async fn wait_for(&self, state: GateState, timeout: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                if rx.borrow().0 == state {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::internal("gate runtime is gone"));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("gate {} never reached {:?}", self.name, state)))?
    }

    /// Gracefully close the gate, draining in-flight connections.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.event_tx.send(Event::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn send(&self, event: Event) -> Result<()> {
        self.event_tx
            .send(event)
            .map_err(|_| Error::internal("gate runtime is gone"))
    }
}

struct ActiveServer {
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    limit: Arc<LimitListener>,
    start_num: u64,
}

struct Runtime {
    name: String,
    spec: Option<HttpServerSpec>,
    mux: Arc<Mux>,
    pipelines: PipelineMap,
    stat: Arc<TrafficStat>,
    start_num: u64,
    server: Option<ActiveServer>,
    state_tx: watch::Sender<(GateState, Option<String>)>,
    event_tx: mpsc::UnboundedSender<Event>,
}

impl Runtime {
    fn set_state(&self, state: GateState, error: Option<String>) {
        let _ = self.state_tx.send((state, error));
    }

    fn state(&self) -> GateState {
        self.state_tx.borrow().0
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut ticker = tokio::time::interval(CHECK_FAILED_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    None => return,
                    Some(Event::Reload(spec)) => self.handle_reload(*spec).await,
                    Some(Event::ServeFailed { start_num, error }) => {
                        self.handle_serve_failed(start_num, error);
                    }
                    Some(Event::Close(ack)) => {
                        self.close_server().await;
                        self.set_state(GateState::Closed, None);
                        let _ = ack.send(());
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if self.state() == GateState::Failed {
                        self.start_server().await;
                    }
                }
            }
        }
    }

    async fn handle_reload(&mut self, next: HttpServerSpec) {
        if let Err(e) = self.mux.reload(&next) {
            tracing::error!(gate = %self.name, error = %e, "mux reload failed");
            return;
        }
        match &self.spec {
            None => {
                self.spec = Some(next);
                self.start_server().await;
            }
            Some(current) if current.needs_restart(&next) => {
                tracing::info!(gate = %self.name, "incompatible spec change, restarting listener");
                self.close_server().await;
                self.spec = Some(next);
                self.start_server().await;
            }
            Some(_) => {
                if let Some(server) = &self.server {
                    server.limit.set_max_connections(next.max_connections);
                }
                self.spec = Some(next);
                tracing::info!(gate = %self.name, "spec applied in place");
            }
        }
    }

    fn handle_serve_failed(&mut self, start_num: u64, error: String) {
        // Stale failures from a listener generation we already replaced.
        if start_num < self.start_num {
            return;
        }
        tracing::error!(gate = %self.name, error = %error, "serve failed");
        self.server = None;
        self.set_state(GateState::Failed, Some(error));
    }

    async fn start_server(&mut self) {
        let Some(spec) = self.spec.clone() else {
            return;
        };
        self.start_num += 1;
        let start_num = self.start_num;

        let listener = match TcpListener::bind(("0.0.0.0", spec.port)).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(gate = %self.name, port = spec.port, error = %e, "bind failed");
                self.set_state(GateState::Failed, Some(e.to_string()));
                return;
            }
        };

        let tls = if spec.https {
            match build_server_tls(
                spec.cert_base64.as_deref().unwrap_or(""),
                spec.key_base64.as_deref().unwrap_or(""),
            ) {
                Ok(config) => Some(TlsAcceptor::from(Arc::new(config))),
                Err(e) => {
                    tracing::error!(gate = %self.name, error = %e, "TLS setup failed");
                    self.set_state(GateState::Failed, Some(e.to_string()));
                    return;
                }
            }
        } else {
            None
        };

        let limit = Arc::new(LimitListener::new(listener, spec.max_connections));
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        tokio::spawn(accept_loop(AcceptLoop {
            gate: self.name.clone(),
            limit: limit.clone(),
            mux: self.mux.clone(),
            pipelines: self.pipelines.clone(),
            stat: self.stat.clone(),
            tls,
            keep_alive: spec.keep_alive,
            cancel: cancel.clone(),
            active: active.clone(),
            event_tx: self.event_tx.clone(),
            start_num,
        }));

        self.server = Some(ActiveServer {
            cancel,
            active,
            limit,
            start_num,
        });
        self.set_state(GateState::Running, None);
        tracing::info!(gate = %self.name, port = spec.port, https = spec.https, "listener started");
    }

    async fn close_server(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        server.cancel.cancel();
        let deadline = tokio::time::Instant::now() + GRACE_WINDOW;
        while server.active.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tracing::info!(gate = %self.name, start_num = server.start_num, "listener closed");
    }
}

struct AcceptLoop {
    gate: String,
    limit: Arc<LimitListener>,
    mux: Arc<Mux>,
    pipelines: PipelineMap,
    stat: Arc<TrafficStat>,
    tls: Option<TlsAcceptor>,
    keep_alive: bool,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    event_tx: mpsc::UnboundedSender<Event>,
    start_num: u64,
}

async fn accept_loop(ctx: AcceptLoop) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            accepted = ctx.limit.accept() => accepted,
        };
        let (stream, peer, permit) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                let _ = ctx.event_tx.send(Event::ServeFailed {
                    start_num: ctx.start_num,
                    error: e.to_string(),
                });
                return;
            }
        };

        ctx.active.fetch_add(1, Ordering::AcqRel);
        let mux = ctx.mux.clone();
        let pipelines = ctx.pipelines.clone();
        let stat = ctx.stat.clone();
        let tls = ctx.tls.clone();
        let keep_alive = ctx.keep_alive;
        let cancel = ctx.cancel.clone();
        let active = ctx.active.clone();
        let gate = ctx.gate.clone();

        tokio::spawn(async move {
            serve_connection(gate, stream, peer, tls, keep_alive, mux, pipelines, stat, cancel)
                .await;
            active.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    gate: String,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    keep_alive: bool,
    mux: Arc<Mux>,
    pipelines: PipelineMap,
    stat: Arc<TrafficStat>,
    cancel: CancellationToken,
) {
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let mux = mux.clone();
        let pipelines = pipelines.clone();
        let stat = stat.clone();
        async move { handle_request(mux, pipelines, stat, peer, req).await }
    });

    match tls {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(gate = %gate, peer = %peer, error = %e, "TLS accept failed");
                    return;
                }
            };
            serve_io(TokioIo::new(tls_stream), service, keep_alive, cancel).await;
        }
        None => {
            serve_io(TokioIo::new(stream), service, keep_alive, cancel).await;
        }
    }
}

async fn serve_io<I, S>(io: I, service: S, keep_alive: bool, cancel: CancellationToken)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    S: hyper::service::Service<
            hyper::Request<Incoming>,
            Response = hyper::Response<Full<Bytes>>,
            Error = Infallible,
        > + Send
        + 'static,
    S::Future: Send,
{
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder.http1().keep_alive(keep_alive);
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                let err = e.to_string();
                if !err.contains("connection closed") && !err.contains("early eof") {
                    tracing::debug!(error = %err, "connection ended with error");
                }
            }
        }
        _ = cancel.cancelled() => {
            // Drain in-flight exchanges within the grace window; idle
            // connections shut down immediately.
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(GRACE_WINDOW, conn.as_mut()).await;
        }
    }
}

async fn handle_request(
    mux: Arc<Mux>,
    pipelines: PipelineMap,
    stat: Arc<TrafficStat>,
    peer: SocketAddr,
    req: hyper::Request<Incoming>,
) -> std::result::Result<hyper::Response<Full<Bytes>>, Infallible> {
    let started = std::time::Instant::now();
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "failed to read request body");
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            ));
        }
    };

    let mut request = Request::new(parts.method, parts.uri);
    request.headers = parts.headers;
    request.set_body(body);
    request.client_addr = Some(peer);

    if mux.snapshot().x_forwarded_for {
        let value = match request.header("x-forwarded-for") {
            Some(existing) => format!("{}, {}", existing, peer.ip()),
            None => peer.ip().to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&value) {
            request.set_header(
                hyper::header::HeaderName::from_static("x-forwarded-for"),
                v,
            );
        }
    }

    let response = match mux.route(&request) {
        RouteResult::IpBlocked => {
            stat.record(started.elapsed(), false);
            plain_response(StatusCode::FORBIDDEN, "forbidden")
        }
        RouteResult::NotFound => {
            stat.record(started.elapsed(), false);
            plain_response(StatusCode::NOT_FOUND, "no route matched")
        }
        RouteResult::Backend(name) => match pipelines.get(&name) {
            None => {
                tracing::warn!(pipeline = %name, "route points at a missing pipeline");
                stat.record(started.elapsed(), true);
                plain_response(StatusCode::SERVICE_UNAVAILABLE, "pipeline not found")
            }
            Some(pipeline) => {
                let mut ctx = Context::new(Protocol::Http, request);
                let result = pipeline.handle(&mut ctx).await;
                let is_error = !result.is_empty() || ctx.response().status.is_server_error();
                stat.record(started.elapsed(), is_error);

                // A terminal result with no assembled response maps to a
                // protocol-appropriate status.
                if !result.is_empty()
                    && ctx.response().status == StatusCode::OK
                    && ctx.response().body().is_empty()
                {
                    ctx.response_mut().status = match result.as_str() {
                        "clientError" => StatusCode::BAD_REQUEST,
                        "timeout" => StatusCode::GATEWAY_TIMEOUT,
                        "internalError" => StatusCode::INTERNAL_SERVER_ERROR,
                        _ => StatusCode::SERVICE_UNAVAILABLE,
                    };
                }

                let entity = ctx.response();
                let mut builder = hyper::Response::builder().status(entity.status);
                if let Some(headers) = builder.headers_mut() {
                    headers.extend(entity.headers.clone());
                }
                builder
                    .body(Full::new(entity.body().clone()))
                    .unwrap_or_else(|_| {
                        plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    })
            }
        },
    };
    Ok(response)
}

fn plain_response(status: StatusCode, message: &str) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response must build")
}

/// Server TLS config from base64-encoded PEM material.
pub(crate) fn build_server_tls(cert_base64: &str, key_base64: &str) -> Result<rustls::ServerConfig> {
    let cert_pem = BASE64
        .decode(cert_base64)
        .map_err(|_| Error::spec("certBase64 is not valid base64"))?;
    let key_pem = BASE64
        .decode(key_base64)
        .map_err(|_| Error::spec("keyBase64 is not valid base64"))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls("certBase64 holds no certificate"));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::tls(format!("invalid key: {}", e)))?
        .ok_or_else(|| Error::tls("keyBase64 holds no private key"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("server TLS setup: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
