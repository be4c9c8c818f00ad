//! MQTT broker gate: connection handling, durable sessions and
//! subscription routing.

mod connection;
pub mod packet;
pub mod session;
pub mod topic;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use self::packet::{Connect, Packet};
use self::session::SessionManager;
use self::topic::TopicManager;
use crate::error::Result;
use crate::gate::http::build_server_tls;
use crate::spec::MqttProxySpec;
use crate::store::Storage;

/// Store key of a session snapshot.
pub fn session_store_key(client_id: &str) -> String {
    format!("/mqtt/sessionMgr/clientID/{}", client_id)
}

/// Store key of a topic index entry.
pub fn topic_store_key(topic: &str) -> String {
    format!("/mqtt/topicMgr/topic/{}", topic)
}

/// Outbound packet channels of currently connected clients.
pub(crate) type ClientMap = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Packet>>>>;

/// Shared broker state: auth table, connected clients, sessions and the
/// topic index.
pub struct BrokerCore {
    name: String,
    auth: RwLock<HashMap<String, String>>,
    pub(crate) clients: ClientMap,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) topics: TopicManager,
}

impl BrokerCore {
    fn new(spec: &MqttProxySpec, storage: Arc<dyn Storage>) -> Arc<Self> {
        let clients: ClientMap = Arc::new(RwLock::new(HashMap::new()));
        let sessions = SessionManager::new(spec.name.clone(), storage.clone(), clients.clone());
        let auth = spec
            .auth
            .iter()
            .map(|a| (a.user_name.clone(), a.pass_base64.clone()))
            .collect();
        Arc::new(Self {
            name: spec.name.clone(),
            auth: RwLock::new(auth),
            clients,
            sessions,
            topics: TopicManager::new(storage),
        })
    }

    fn authenticate(&self, connect: &Connect) -> bool {
        let Some(username) = &connect.username else {
            return false;
        };
        let Some(password) = &connect.password else {
            return false;
        };
        let auth = self.auth.read().expect("auth lock poisoned");
        match auth.get(username) {
            Some(expected) => BASE64.encode(password) == *expected,
            None => false,
        }
    }

    /// Dispatch a message to every session whose subscriptions match the
    /// topic, whatever the source (client, HTTP side-channel, bridge).
    pub fn publish(&self, topic: &str, payload: Bytes, qos: u8) {
        for (client_id, _subscribed_qos) in self.topics.subscribers(topic) {
            if let Some(session) = self.sessions.get(&client_id) {
                session.publish(topic, payload.clone(), qos);
            }
        }
    }
}

/// Status snapshot of the broker gate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttStatus {
    pub name: String,
    pub connected_clients: usize,
}

/// The MQTT broker gate object.
pub struct MqttProxy {
    name: String,
    core: Arc<BrokerCore>,
    cancel: CancellationToken,
    port: u16,
}

impl MqttProxy {
    /// Bind the broker listener and start accepting clients. A bind failure
    /// is a startup error, surfaced to the caller.
    pub async fn new(spec: MqttProxySpec, storage: Arc<dyn Storage>) -> Result<Self> {
        spec.validate()?;
        let core = BrokerCore::new(&spec, storage);
        let listener = TcpListener::bind(("0.0.0.0", spec.port)).await?;

        let tls = if spec.use_tls {
            let config = build_server_tls(
                spec.cert_base64.as_deref().unwrap_or(""),
                spec.key_base64.as_deref().unwrap_or(""),
            )?;
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(
            core.clone(),
            listener,
            tls,
            cancel.clone(),
        ));
        tracing::info!(broker = %spec.name, port = spec.port, tls = spec.use_tls, "mqtt broker started");

        Ok(Self {
            name: spec.name.clone(),
            core,
            cancel,
            port: spec.port,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Replace the credential table from a new spec generation.
    pub fn reload(&self, spec: &MqttProxySpec) -> Result<()> {
        spec.validate()?;
        let next: HashMap<String, String> = spec
            .auth
            .iter()
            .map(|a| (a.user_name.clone(), a.pass_base64.clone()))
            .collect();
        *self.core.auth.write().expect("auth lock poisoned") = next;
        Ok(())
    }

    /// Publish from a non-client source (e.g. the HTTP side-channel).
    pub fn publish(&self, topic: &str, payload: Bytes, qos: u8) {
        self.core.publish(topic, payload, qos);
    }

    pub fn status(&self) -> MqttStatus {
        MqttStatus {
            name: self.name.clone(),
            connected_clients: self
                .core
                .clients
                .read()
                .expect("client map lock poisoned")
                .len(),
        }
    }

    /// Stop accepting and close every session; clean sessions leave the
    /// store.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.core.sessions.close_all();
        tracing::info!(broker = %self.name, "mqtt broker closed");
    }
}

async fn accept_loop(
    core: Arc<BrokerCore>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(broker = %core.name, error = %e, "mqtt accept failed");
                continue;
            }
        };
        let core = core.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        connection::handle_connection(core, tls_stream, peer).await;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "mqtt TLS accept failed");
                    }
                },
                None => connection::handle_connection(core, stream, peer).await,
            }
        });
    }
}
