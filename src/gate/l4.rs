//! Layer-4 context and pooled byte buffers shared by the TCP and UDP gates.

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::filters::proxy::balance::{new_balancer, BalanceKey, Balancer, Server};
use crate::spec::L4PoolSpec;

const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;
const MAX_POOLED_BUFFERS: usize = 256;

/// Free list of reusable byte buffers. Buffers are returned on drop of the
/// [`PooledBuffer`] handle.
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
            capacity,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity));
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.buffers.lock().expect("buffer pool lock poisoned");
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Protocol tag of an L4 context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

struct L4Buffers {
    upstream_write: BytesMut,
    downstream_write: BytesMut,
}

/// Per-connection (or per-session) L4 state. Not concurrency-safe by
/// design; concurrent writers serialize through the internal lock.
pub struct Layer4Context {
    pub protocol: L4Protocol,
    pub local_addr: SocketAddr,
    pub downstream_addr: SocketAddr,
    pub upstream_addr: String,
    pub start: Instant,
    buffers: Mutex<L4Buffers>,
}

impl Layer4Context {
    pub fn new(
        protocol: L4Protocol,
        local_addr: SocketAddr,
        downstream_addr: SocketAddr,
        upstream_addr: String,
    ) -> Self {
        Self {
            protocol,
            local_addr,
            downstream_addr,
            upstream_addr,
            start: Instant::now(),
            buffers: Mutex::new(L4Buffers {
                upstream_write: BytesMut::new(),
                downstream_write: BytesMut::new(),
            }),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    /// Queue bytes for the upstream side.
    pub fn append_upstream_write_buffer(&self, data: &[u8]) {
        self.buffers
            .lock()
            .expect("l4 context lock poisoned")
            .upstream_write
            .extend_from_slice(data);
    }

    /// Take everything queued for the upstream side.
    pub fn take_upstream_write_buffer(&self) -> Option<Bytes> {
        let mut buffers = self.buffers.lock().expect("l4 context lock poisoned");
        if buffers.upstream_write.is_empty() {
            return None;
        }
        Some(buffers.upstream_write.split().freeze())
    }

    /// Queue bytes for the downstream side.
    pub fn append_downstream_write_buffer(&self, data: &[u8]) {
        self.buffers
            .lock()
            .expect("l4 context lock poisoned")
            .downstream_write
            .extend_from_slice(data);
    }

    /// Take everything queued for the downstream side.
    pub fn take_downstream_write_buffer(&self) -> Option<Bytes> {
        let mut buffers = self.buffers.lock().expect("l4 context lock poisoned");
        if buffers.downstream_write.is_empty() {
            return None;
        }
        Some(buffers.downstream_write.split().freeze())
    }
}

/// Upstream set shared by the L4 gates: servers plus a balance policy.
pub(crate) struct L4Backend {
    servers: Vec<Arc<Server>>,
    balancer: Box<dyn Balancer>,
}

impl L4Backend {
    pub(crate) fn new(spec: &L4PoolSpec) -> Result<Self> {
        spec.validate()?;
        let servers = spec
            .servers
            .iter()
            .map(|s| Server::new(s).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            servers,
            balancer: new_balancer(&spec.load_balance)?,
        })
    }

    pub(crate) fn pick(&self, client: SocketAddr) -> Option<Arc<Server>> {
        let healthy: Vec<Arc<Server>> = self
            .servers
            .iter()
            .filter(|s| s.healthy())
            .cloned()
            .collect();
        let key = BalanceKey {
            client_ip: Some(client.ip()),
            header: None,
        };
        self.balancer.select(&healthy, &key).cloned()
    }
}
