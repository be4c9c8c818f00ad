//! TCP traffic gate: accept, pick an upstream, pump bytes both ways.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::http::{GateState, GateStatus};
use super::l4::{BufferPool, L4Backend, L4Protocol, Layer4Context};
use super::limit::LimitListener;
use crate::error::{Error, Result};
use crate::spec::{parse_duration, TcpServerSpec};
use crate::stat::TrafficStat;

enum Event {
    Reload(Box<TcpServerSpec>),
    ServeFailed { start_num: u64, error: String },
    Close(oneshot::Sender<()>),
}

/// The TCP traffic gate object.
pub struct TcpServer {
    name: String,
    event_tx: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<(GateState, Option<String>)>,
    stat: Arc<TrafficStat>,
}

impl TcpServer {
    pub fn new(spec: TcpServerSpec) -> Result<Self> {
        spec.validate()?;
        let name = spec.name.clone();
        let backend = Arc::new(RwLock::new(Arc::new(L4Backend::new(&spec.pool)?)));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel((GateState::Nil, None));
        let stat = Arc::new(TrafficStat::new());

        let runtime = Runtime {
            name: name.clone(),
            spec: None,
            backend,
            buffers: BufferPool::new(),
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

    pub fn reload(&self, spec: TcpServerSpec) -> Result<()> {
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
}

struct Runtime {
    name: String,
    spec: Option<TcpServerSpec>,
    backend: Arc<RwLock<Arc<L4Backend>>>,
    buffers: Arc<BufferPool>,
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
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    None => return,
                    Some(Event::Reload(spec)) => self.handle_reload(*spec).await,
                    Some(Event::ServeFailed { start_num, error }) => {
                        if start_num >= self.start_num {
                            self.server = None;
                            self.set_state(GateState::Failed, Some(error));
                        }
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

    async fn handle_reload(&mut self, next: TcpServerSpec) {
        match L4Backend::new(&next.pool) {
            Ok(backend) => {
                *self.backend.write().expect("backend lock poisoned") = Arc::new(backend);
            }
            Err(e) => {
                tracing::error!(gate = %self.name, error = %e, "pool reload failed");
                return;
            }
        }
        let restart = match &self.spec {
            None => true,
            Some(current) => current.port != next.port,
        };
        if restart {
            self.close_server().await;
            self.spec = Some(next);
            self.start_server().await;
        } else {
            if let Some(server) = &self.server {
                server.limit.set_max_connections(next.max_connections);
            }
            self.spec = Some(next);
        }
    }

    async fn start_server(&mut self) {
        let Some(spec) = self.spec.clone() else {
            return;
        };
        self.start_num += 1;

        let listener = match TcpListener::bind(("0.0.0.0", spec.port)).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(gate = %self.name, port = spec.port, error = %e, "bind failed");
                self.set_state(GateState::Failed, Some(e.to_string()));
                return;
            }
        };

        let connect_timeout =
            parse_duration(&spec.connect_timeout).unwrap_or(Duration::from_secs(5));
        let limit = Arc::new(LimitListener::new(listener, spec.max_connections));
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let gate = self.name.clone();
        let backend = self.backend.clone();
        let buffers = self.buffers.clone();
        let stat = self.stat.clone();
        let event_tx = self.event_tx.clone();
        let start_num = self.start_num;
        let limit_task = limit.clone();
        let cancel_task = cancel.clone();
        let active_task = active.clone();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel_task.cancelled() => return,
                    accepted = limit_task.accept() => accepted,
                };
                let (stream, peer, permit) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = event_tx.send(Event::ServeFailed {
                            start_num,
                            error: e.to_string(),
                        });
                        return;
                    }
                };

                let backend = backend.read().expect("backend lock poisoned").clone();
                let buffers = buffers.clone();
                let stat = stat.clone();
                let cancel = cancel_task.clone();
                let active = active_task.clone();
                let gate = gate.clone();
                active.fetch_add(1, Ordering::AcqRel);

                tokio::spawn(async move {
                    let started = std::time::Instant::now();
                    let ok =
                        proxy_connection(gate, stream, peer, backend, buffers, connect_timeout, cancel)
                            .await
                            .is_ok();
                    stat.record(started.elapsed(), !ok);
                    active.fetch_sub(1, Ordering::AcqRel);
                    drop(permit);
                });
            }
        });

        self.server = Some(ActiveServer {
            cancel,
            active,
            limit,
        });
        self.set_state(GateState::Running, None);
        tracing::info!(gate = %self.name, port = spec.port, "TCP listener started");
    }

    async fn close_server(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        server.cancel.cancel();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while server.active.load(Ordering::Acquire) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn proxy_connection(
    gate: String,
    downstream: TcpStream,
    peer: std::net::SocketAddr,
    backend: Arc<L4Backend>,
    buffers: Arc<BufferPool>,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let server = backend
        .pick(peer)
        .ok_or_else(|| Error::internal("no healthy upstream"))?;

    let upstream = tokio::time::timeout(connect_timeout, TcpStream::connect(server.authority()))
        .await
        .map_err(|_| Error::timeout(format!("connect to {}", server.url)))?
        .map_err(Error::Io)?;

    let ctx = Arc::new(Layer4Context::new(
        L4Protocol::Tcp,
        downstream.local_addr()?,
        peer,
        server.authority(),
    ));
    tracing::debug!(gate = %gate, peer = %peer, upstream = %server.url, "TCP session opened");

    let (mut down_read, mut down_write) = downstream.into_split();
    let (mut up_read, mut up_write) = upstream.into_split();

    let ctx_up = ctx.clone();
    let buffers_up = buffers.clone();
    let to_upstream = async move {
        let mut buf = buffers_up.acquire();
        loop {
            buf.clear();
            let n = down_read.read_buf(&mut *buf).await?;
            if n == 0 {
                break;
            }
            ctx_up.append_upstream_write_buffer(&buf[..n]);
            if let Some(bytes) = ctx_up.take_upstream_write_buffer() {
                up_write.write_all(&bytes).await?;
            }
        }
        up_write.shutdown().await.ok();
        Ok::<(), std::io::Error>(())
    };

    let ctx_down = ctx.clone();
    let to_downstream = async move {
        let mut buf = buffers.acquire();
        loop {
            buf.clear();
            let n = up_read.read_buf(&mut *buf).await?;
            if n == 0 {
                break;
            }
            ctx_down.append_downstream_write_buffer(&buf[..n]);
            if let Some(bytes) = ctx_down.take_downstream_write_buffer() {
                down_write.write_all(&bytes).await?;
            }
        }
        down_write.shutdown().await.ok();
        Ok::<(), std::io::Error>(())
    };

    tokio::select! {
        result = async { tokio::try_join!(to_upstream, to_downstream) } => {
            result.map_err(Error::Io)?;
        }
        _ = cancel.cancelled() => {}
    }
    tracing::debug!(gate = %gate, peer = %peer, elapsed_ms = ctx.elapsed().as_millis() as u64, "TCP session closed");
    Ok(())
}
