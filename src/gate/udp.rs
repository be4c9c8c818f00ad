//! UDP traffic gate: one datagram socket, sessions demultiplexed by
//! downstream address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::http::{GateState, GateStatus};
use super::l4::L4Backend;
use crate::error::{Error, Result};
use crate::spec::{parse_duration, UdpServerSpec};
use crate::stat::TrafficStat;

/// Packets queued per session before writers start blocking.
const SESSION_QUEUE: usize = 512;
/// Closed sessions are swept from the table on this cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Clone)]
struct UdpConfig {
    downstream_idle_timeout: Duration,
    upstream_idle_timeout: Duration,
    duplex: bool,
}

enum Event {
    Reload(Box<UdpServerSpec>),
    ServeFailed { start_num: u64, error: String },
    Close(oneshot::Sender<()>),
}

/// The UDP traffic gate object.
pub struct UdpServer {
    name: String,
    event_tx: mpsc::UnboundedSender<Event>,
    state_rx: watch::Receiver<(GateState, Option<String>)>,
    stat: Arc<TrafficStat>,
}

impl UdpServer {
    pub fn new(spec: UdpServerSpec) -> Result<Self> {
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
            config: Arc::new(RwLock::new(UdpConfig {
                downstream_idle_timeout: Duration::from_secs(60),
                upstream_idle_timeout: Duration::from_secs(60),
                duplex: true,
            })),
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

    pub fn reload(&self, spec: UdpServerSpec) -> Result<()> {
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

type SessionTable = Arc<RwLock<HashMap<SocketAddr, Arc<UdpSession>>>>;

struct ActiveServer {
    cancel: CancellationToken,
    sessions: SessionTable,
}

struct Runtime {
    name: String,
    spec: Option<UdpServerSpec>,
    backend: Arc<RwLock<Arc<L4Backend>>>,
    config: Arc<RwLock<UdpConfig>>,
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
                            self.close_server();
                            self.set_state(GateState::Failed, Some(error));
                        }
                    }
                    Some(Event::Close(ack)) => {
                        self.close_server();
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

    async fn handle_reload(&mut self, next: UdpServerSpec) {
        match L4Backend::new(&next.pool) {
            Ok(backend) => {
                *self.backend.write().expect("backend lock poisoned") = Arc::new(backend);
            }
            Err(e) => {
                tracing::error!(gate = %self.name, error = %e, "pool reload failed");
                return;
            }
        }
        if let (Ok(down), Ok(up)) = (
            parse_duration(&next.downstream_idle_timeout),
            parse_duration(&next.upstream_idle_timeout),
        ) {
            *self.config.write().expect("config lock poisoned") = UdpConfig {
                downstream_idle_timeout: down,
                upstream_idle_timeout: up,
                duplex: next.duplex,
            };
        }

        let restart = match &self.spec {
            None => true,
            Some(current) => current.port != next.port,
        };
        self.spec = Some(next);
        if restart {
            self.close_server();
            self.start_server().await;
        }
    }

    async fn start_server(&mut self) {
        let Some(spec) = self.spec.clone() else {
            return;
        };
        self.start_num += 1;

        let socket = match UdpSocket::bind(("0.0.0.0", spec.port)).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::error!(gate = %self.name, port = spec.port, error = %e, "bind failed");
                self.set_state(GateState::Failed, Some(e.to_string()));
                return;
            }
        };

        let sessions: SessionTable = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(recv_loop(RecvLoop {
            gate: self.name.clone(),
            socket,
            sessions: sessions.clone(),
            backend: self.backend.clone(),
            config: self.config.clone(),
            stat: self.stat.clone(),
            cancel: cancel.clone(),
            event_tx: self.event_tx.clone(),
            start_num: self.start_num,
        }));
        tokio::spawn(sweep_loop(sessions.clone(), cancel.clone()));

        self.server = Some(ActiveServer { cancel, sessions });
        self.set_state(GateState::Running, None);
        tracing::info!(gate = %self.name, port = spec.port, "UDP listener started");
    }

    fn close_server(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        server.cancel.cancel();
        for session in server.sessions.read().expect("session lock poisoned").values() {
            session.close();
        }
    }
}

struct RecvLoop {
    gate: String,
    socket: Arc<UdpSocket>,
    sessions: SessionTable,
    backend: Arc<RwLock<Arc<L4Backend>>>,
    config: Arc<RwLock<UdpConfig>>,
    stat: Arc<TrafficStat>,
    cancel: CancellationToken,
    event_tx: mpsc::UnboundedSender<Event>,
    start_num: u64,
}

async fn recv_loop(ctx: RecvLoop) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            received = ctx.socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                let _ = ctx.event_tx.send(Event::ServeFailed {
                    start_num: ctx.start_num,
                    error: e.to_string(),
                });
                return;
            }
        };

        let started = std::time::Instant::now();
        let session = match lookup_session(&ctx, peer).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(gate = %ctx.gate, peer = %peer, error = %e, "session setup failed");
                ctx.stat.record(started.elapsed(), true);
                continue;
            }
        };

        let ok = session
            .write(Bytes::copy_from_slice(&buf[..n]))
            .await
            .is_ok();
        ctx.stat.record(started.elapsed(), !ok);
    }
}

async fn lookup_session(ctx: &RecvLoop, peer: SocketAddr) -> Result<Arc<UdpSession>> {
    if let Some(session) = ctx.sessions.read().expect("session lock poisoned").get(&peer) {
        if !session.is_closed() {
            return Ok(session.clone());
        }
    }

    let backend = ctx.backend.read().expect("backend lock poisoned").clone();
    let server = backend
        .pick(peer)
        .ok_or_else(|| Error::internal("no upstream server"))?;
    let upstream = UdpSocket::bind("0.0.0.0:0").await?;
    upstream.connect(server.authority()).await?;

    let config = ctx.config.read().expect("config lock poisoned").clone();
    let session = UdpSession::spawn(
        ctx.socket.clone(),
        peer,
        Arc::new(upstream),
        server.authority(),
        config,
    );
    ctx.sessions
        .write()
        .expect("session lock poisoned")
        .insert(peer, session.clone());
    Ok(session)
}

async fn sweep_loop(sessions: SessionTable, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        sessions
            .write()
            .expect("session lock poisoned")
            .retain(|_, s| !s.is_closed());
    }
}

/// One downstream address paired with an upstream connection.
pub struct UdpSession {
    downstream: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    stopped: Arc<AtomicBool>,
    cancel: CancellationToken,
    write_timeout: Duration,
}

impl UdpSession {
    fn spawn(
        gate_socket: Arc<UdpSocket>,
        downstream: SocketAddr,
        upstream: Arc<UdpSocket>,
        upstream_addr: String,
        config: UdpConfig,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Bytes>(SESSION_QUEUE);
        let stopped = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let write_timeout = if config.upstream_idle_timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            config.upstream_idle_timeout
        };

        let session = Arc::new(Self {
            downstream,
            tx,
            stopped,
            cancel,
            write_timeout,
        });

        // Writer: drain the queue to the upstream; the recv timeout doubles
        // as the downstream idle timer.
        {
            let session = session.clone();
            let upstream = upstream.clone();
            let upstream_addr = upstream_addr.clone();
            let idle = config.downstream_idle_timeout;
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        next = tokio::time::timeout(idle, rx.recv()) => next,
                    };
                    match next {
                        Err(_) => {
                            tracing::debug!(downstream = %session.downstream, "session idle, closing");
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(packet)) => {
                            if let Err(e) = upstream.send(&packet).await {
                                tracing::warn!(
                                    upstream = %upstream_addr,
                                    error = %e,
                                    "udp flush to upstream failed"
                                );
                                break;
                            }
                        }
                    }
                }
                session.close();
            });
        }

        // Duplex reader: forward upstream datagrams back to the downstream
        // address; the read deadline follows the upstream idle timeout.
        if config.duplex {
            let session = session.clone();
            let read_timeout = write_timeout;
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let received = tokio::select! {
                        _ = session.cancel.cancelled() => break,
                        received = tokio::time::timeout(read_timeout, upstream.recv(&mut buf)) => received,
                    };
                    match received {
                        Err(_) => continue,
                        Ok(Err(_)) => break,
                        Ok(Ok(n)) => {
                            if let Err(e) =
                                gate_socket.send_to(&buf[..n], session.downstream).await
                            {
                                tracing::warn!(
                                    downstream = %session.downstream,
                                    error = %e,
                                    "udp send to downstream failed"
                                );
                                break;
                            }
                        }
                    }
                }
                session.close();
            });
        }

        session
    }

    /// Queue a packet for the upstream, blocking up to the write timeout
    /// when the queue is full.
    pub async fn write(&self, packet: Bytes) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self.tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(packet)) => {
                match tokio::time::timeout(self.write_timeout, self.tx.send(packet)).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(Error::timeout("udp session write queue full")),
                }
            }
        }
    }

    /// Idempotent close via CAS on the stopped flag; the table sweeper
    /// removes the entry later.
    pub fn close(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
