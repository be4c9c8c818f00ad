//! Connection-capped TCP listener.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A TCP listener that blocks accepting once `max_connections` are live.
/// Dropping a [`ConnectionPermit`] releases its slot.
pub struct LimitListener {
    inner: TcpListener,
    semaphore: Arc<Semaphore>,
    max: Mutex<usize>,
}

impl LimitListener {
    pub fn new(listener: TcpListener, max_connections: usize) -> Self {
        Self {
            inner: listener,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max: Mutex::new(max_connections),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for a free slot, then accept.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limit semaphore closed");
        let (stream, addr) = self.inner.accept().await?;
        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Adjust the cap in place. Increases take effect immediately; decreases
    /// absorb slots as connections drain.
    pub fn set_max_connections(&self, new_max: usize) {
        let mut max = self.max.lock().expect("limit lock poisoned");
        if new_max > *max {
            self.semaphore.add_permits(new_max - *max);
        } else if new_max < *max {
            let delta = (*max - new_max) as u32;
            let semaphore = self.semaphore.clone();
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(delta).await {
                    permits.forget();
                }
            });
        }
        *max = new_max;
    }
}

/// Slot held for the lifetime of one accepted connection.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
