//! Per-client MQTT connection handling.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use super::packet::{
    MqttCodec, Packet, CONNACK_ACCEPTED, CONNACK_BAD_CREDENTIALS,
};
use super::BrokerCore;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one client connection: CONNECT handshake, then packet events
/// until disconnect.
pub(crate) async fn handle_connection<S>(core: Arc<BrokerCore>, stream: S, peer: std::net::SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = serve(core, stream, peer).await {
        tracing::debug!(peer = %peer, error = %e, "mqtt connection ended");
    }
}

async fn serve<S>(core: Arc<BrokerCore>, stream: S, peer: std::net::SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, MqttCodec);

    let first = tokio::time::timeout(CONNECT_TIMEOUT, framed.next())
        .await
        .map_err(|_| Error::mqtt("client never sent CONNECT"))?
        .ok_or_else(|| Error::mqtt("connection closed before CONNECT"))??;
    let Packet::Connect(connect) = first else {
        return Err(Error::mqtt("first packet was not CONNECT"));
    };

    if !core.authenticate(&connect) {
        tracing::warn!(peer = %peer, client = %connect.client_id, "mqtt auth rejected");
        framed
            .send(Packet::ConnAck {
                session_present: false,
                code: CONNACK_BAD_CREDENTIALS,
            })
            .await?;
        return Ok(());
    }

    let (session, resumed) = core.sessions.get_or_create(&connect)?;
    let client_id = connect.client_id.clone();
    framed
        .send(Packet::ConnAck {
            session_present: resumed && !connect.clean_session,
            code: CONNACK_ACCEPTED,
        })
        .await?;
    tracing::info!(peer = %peer, client = %client_id, resumed, "mqtt client connected");

    // Register the outbound channel; sessions and the broker route through
    // it. A reconnect replaces the entry, so cleanup below compares channels.
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    core.clients
        .write()
        .expect("client map lock poisoned")
        .insert(client_id.clone(), tx.clone());

    // A resumed session re-registers its subscriptions with the index.
    for (topic, qos) in session.subscriptions() {
        core.topics.subscribe(&topic, &client_id, qos)?;
    }

    let (mut sink, mut source) = framed.split();
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });

    let keep_alive = if connect.keep_alive > 0 {
        // MQTT allows one and a half keep-alive periods of silence.
        Some(Duration::from_secs(u64::from(connect.keep_alive) * 3 / 2 + 1))
    } else {
        None
    };

    let result = read_loop(&core, &session, &client_id, &tx, &mut source, keep_alive).await;

    // Drop the outbound channel unless a newer connection took the name.
    {
        let mut clients = core.clients.write().expect("client map lock poisoned");
        if clients
            .get(&client_id)
            .is_some_and(|current| current.same_channel(&tx))
        {
            clients.remove(&client_id);
        }
    }
    drop(tx);
    writer.abort();

    if session.clean_flag() {
        core.topics.remove_client(&client_id)?;
        core.sessions.client_gone(&client_id)?;
    }
    tracing::info!(client = %client_id, "mqtt client disconnected");
    result
}

async fn read_loop<S>(
    core: &Arc<BrokerCore>,
    session: &Arc<super::session::Session>,
    client_id: &str,
    tx: &mpsc::UnboundedSender<Packet>,
    source: &mut futures_util::stream::SplitStream<Framed<S, MqttCodec>>,
    keep_alive: Option<Duration>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = match keep_alive {
            Some(window) => match tokio::time::timeout(window, source.next()).await {
                Ok(frame) => frame,
                Err(_) => return Err(Error::mqtt("keep-alive window expired")),
            },
            None => source.next().await,
        };
        let Some(frame) = next else {
            return Ok(());
        };

        match frame? {
            Packet::Publish(publish) => match publish.qos {
                0 => core.publish(&publish.topic, publish.payload, 0),
                1 => {
                    let id = publish
                        .packet_id
                        .ok_or_else(|| Error::mqtt("qos-1 publish without packet id"))?;
                    core.publish(&publish.topic, publish.payload, 1);
                    let _ = tx.send(Packet::PubAck { packet_id: id });
                }
                _ => {
                    tracing::error!(client = %client_id, "qos=2 publish is not supported");
                }
            },
            Packet::PubAck { packet_id } => session.puback(packet_id),
            Packet::Subscribe { packet_id, topics } => {
                let granted: Vec<(String, u8)> = topics
                    .iter()
                    .map(|(topic, qos)| (topic.clone(), (*qos).min(1)))
                    .collect();
                session.subscribe(&granted);
                for (topic, qos) in &granted {
                    core.topics.subscribe(topic, client_id, *qos)?;
                }
                let _ = tx.send(Packet::SubAck {
                    packet_id,
                    codes: granted.iter().map(|(_, qos)| *qos).collect(),
                });
            }
            Packet::Unsubscribe { packet_id, topics } => {
                session.unsubscribe(&topics);
                for topic in &topics {
                    core.topics.unsubscribe(topic, client_id)?;
                }
                let _ = tx.send(Packet::UnsubAck { packet_id });
            }
            Packet::PingReq => {
                let _ = tx.send(Packet::PingResp);
            }
            Packet::Disconnect => return Ok(()),
            other => {
                return Err(Error::mqtt(format!(
                    "unexpected packet from client: {:?}",
                    other
                )));
            }
        }
    }
}
