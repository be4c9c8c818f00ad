//! MQTT session state: subscriptions, qos-1 pending queue and durability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::packet::{Connect, Packet, Publish};
use super::{session_store_key, ClientMap};
use crate::error::{Error, Result};
use crate::store::Storage;

/// Resend cadence for unacknowledged qos-1 messages.
const RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Durable part of a session, YAML-encoded into the store.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionInfo {
    #[serde(rename = "egName")]
    pub eg_name: String,
    pub topics: HashMap<String, u8>,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "cleanFlag")]
    pub clean_flag: bool,
}

/// One store write: session key plus its encoded snapshot.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    topic: String,
    payload: Bytes,
    qos: u8,
}

struct SessionInner {
    info: SessionInfo,
    pending: HashMap<u16, PendingMessage>,
    pending_queue: Vec<u16>,
    next_id: u16,
}

/// The connection-independent state of one MQTT client.
pub struct Session {
    inner: Mutex<SessionInner>,
    store_tx: mpsc::Sender<SessionStore>,
    clients: ClientMap,
    done: CancellationToken,
}

impl Session {
    fn new(
        info: SessionInfo,
        store_tx: mpsc::Sender<SessionStore>,
        clients: ClientMap,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            inner: Mutex::new(SessionInner {
                info,
                pending: HashMap::new(),
                pending_queue: Vec::new(),
                next_id: 1,
            }),
            store_tx,
            clients,
            done: CancellationToken::new(),
        });

        // Background resend of unacknowledged qos-1 messages: the head of
        // the queue still pending is retransmitted once per tick.
        let resender = session.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESEND_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = resender.done.cancelled() => return,
                    _ = ticker.tick() => resender.resend_head(),
                }
            }
        });

        session
    }

    pub fn client_id(&self) -> String {
        self.lock().info.client_id.clone()
    }

    pub fn clean_flag(&self) -> bool {
        self.lock().info.clean_flag
    }

    pub fn subscriptions(&self) -> HashMap<String, u8> {
        self.lock().info.topics.clone()
    }

    pub fn pending_ids(&self) -> Vec<u16> {
        self.lock().pending_queue.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session lock poisoned")
    }

    pub fn subscribe(&self, topics: &[(String, u8)]) {
        let mut inner = self.lock();
        for (topic, qos) in topics {
            inner.info.topics.insert(topic.clone(), *qos);
        }
        self.snapshot(&inner.info);
    }

    /// Remove subscriptions and purge pending messages whose topic no
    /// longer has one.
    pub fn unsubscribe(&self, topics: &[String]) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for topic in topics {
            inner.info.topics.remove(topic);
        }
        inner
            .pending
            .retain(|_, message| !topics.contains(&message.topic));
        let pending = &inner.pending;
        inner.pending_queue.retain(|id| pending.contains_key(id));
        self.snapshot(&inner.info);
    }

    /// Deliver a message to this session's client if it subscribed to the
    /// topic at a qos at least as high.
    pub fn publish(&self, topic: &str, payload: Bytes, qos: u8) {
        let mut inner = self.lock();
        match inner.info.topics.get(topic) {
            Some(&subscribed) if subscribed >= qos => {}
            _ => return,
        }

        match qos {
            0 => {
                let packet = Packet::Publish(Publish {
                    dup: false,
                    qos: 0,
                    retain: false,
                    topic: topic.to_string(),
                    packet_id: None,
                    payload,
                });
                self.send_to_client(&inner.info.client_id, packet);
            }
            1 => {
                let id = inner.next_id;
                // Packet ids wrap mod 2^16, skipping the reserved zero.
                inner.next_id = match inner.next_id.wrapping_add(1) {
                    0 => 1,
                    n => n,
                };
                inner.pending.insert(
                    id,
                    PendingMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                        qos,
                    },
                );
                inner.pending_queue.push(id);
                let packet = Packet::Publish(Publish {
                    dup: false,
                    qos: 1,
                    retain: false,
                    topic: topic.to_string(),
                    packet_id: Some(id),
                    payload,
                });
                self.send_to_client(&inner.info.client_id, packet);
            }
            _ => {
                tracing::error!(
                    client = %inner.info.client_id,
                    topic = %topic,
                    "publishing with qos=2 is not supported"
                );
            }
        }
    }

    pub fn puback(&self, packet_id: u16) {
        self.lock().pending.remove(&packet_id);
    }

    fn resend_head(&self) {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            inner.pending_queue.clear();
            return;
        }
        let Some(position) = inner
            .pending_queue
            .iter()
            .position(|id| inner.pending.contains_key(id))
        else {
            return;
        };
        inner.pending_queue.drain(..position);
        let id = inner.pending_queue[0];
        let message = inner.pending[&id].clone();
        let packet = Packet::Publish(Publish {
            dup: true,
            qos: message.qos,
            retain: false,
            topic: message.topic,
            packet_id: Some(id),
            payload: message.payload,
        });
        self.send_to_client(&inner.info.client_id, packet);
    }

    fn send_to_client(&self, client_id: &str, packet: Packet) {
        let clients = self.clients.read().expect("client map lock poisoned");
        if let Some(tx) = clients.get(client_id) {
            let _ = tx.send(packet);
        }
    }

    fn snapshot(&self, info: &SessionInfo) {
        let value = match serde_yaml::to_string(info) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(client = %info.client_id, error = %e, "session encode failed");
                return;
            }
        };
        // Only the latest snapshot matters; a full queue just coalesces.
        let _ = self.store_tx.try_send(SessionStore {
            key: info.client_id.clone(),
            value,
        });
    }

    /// Stop the resend loop. Idempotent.
    pub fn close(&self) {
        self.done.cancel();
    }
}

/// Owns the session table and the single-writer store channel.
pub struct SessionManager {
    eg_name: String,
    storage: Arc<dyn Storage>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store_tx: mpsc::Sender<SessionStore>,
    clients: ClientMap,
}

impl SessionManager {
    pub fn new(eg_name: String, storage: Arc<dyn Storage>, clients: ClientMap) -> Arc<Self> {
        let (store_tx, mut store_rx) = mpsc::channel::<SessionStore>(64);
        let writer_storage = storage.clone();
        tokio::spawn(async move {
            while let Some(event) = store_rx.recv().await {
                if let Err(e) = writer_storage.put(&session_store_key(&event.key), &event.value) {
                    tracing::error!(client = %event.key, error = %e, "session store write failed");
                }
            }
        });

        Arc::new(Self {
            eg_name,
            storage,
            sessions: RwLock::new(HashMap::new()),
            store_tx,
            clients,
        })
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .get(client_id)
            .cloned()
    }

    /// Resolve the session for a CONNECT: resume a live or stored session
    /// for `cleanSession=false` clients, otherwise start fresh. Returns the
    /// session and whether it was resumed.
    pub fn get_or_create(&self, connect: &Connect) -> Result<(Arc<Session>, bool)> {
        let client_id = connect.client_id.clone();

        if connect.clean_session {
            if let Some(old) = self.remove(&client_id) {
                old.close();
            }
            self.storage.delete(&session_store_key(&client_id))?;
            return Ok((self.insert_fresh(connect), false));
        }

        if let Some(session) = self.get(&client_id) {
            return Ok((session, true));
        }

        if let Some(stored) = self.storage.get(&session_store_key(&client_id))? {
            let info: SessionInfo = serde_yaml::from_str(&stored)
                .map_err(|e| Error::storage(format!("session {} decode: {}", client_id, e)))?;
            let session = Session::new(info, self.store_tx.clone(), self.clients.clone());
            self.sessions
                .write()
                .expect("session table lock poisoned")
                .insert(client_id, session.clone());
            return Ok((session, true));
        }

        Ok((self.insert_fresh(connect), false))
    }

    fn insert_fresh(&self, connect: &Connect) -> Arc<Session> {
        let info = SessionInfo {
            eg_name: self.eg_name.clone(),
            topics: HashMap::new(),
            client_id: connect.client_id.clone(),
            clean_flag: connect.clean_session,
        };
        let session = Session::new(info, self.store_tx.clone(), self.clients.clone());
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .insert(connect.client_id.clone(), session.clone());
        session
    }

    fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .expect("session table lock poisoned")
            .remove(client_id)
    }

    /// Handle a client disconnect: clean sessions are dropped from both the
    /// table and the store, durable sessions stay resident for resume.
    pub fn client_gone(&self, client_id: &str) -> Result<()> {
        let Some(session) = self.get(client_id) else {
            return Ok(());
        };
        if session.clean_flag() {
            session.close();
            self.remove(client_id);
            self.storage.delete(&session_store_key(client_id))?;
        }
        Ok(())
    }

    /// Close every session. Clean ones are removed from the store.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .expect("session table lock poisoned")
            .values()
            .cloned()
            .collect();
        for session in sessions {
            let client_id = session.client_id();
            session.close();
            if session.clean_flag() {
                let _ = self.storage.delete(&session_store_key(&client_id));
            }
        }
    }
}
