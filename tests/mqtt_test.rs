//! MQTT broker tests over a raw framed client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::free_tcp_port;
use futures_util::{SinkExt, StreamExt};
use propylon::mqtt::packet::{
    Connect, MqttCodec, Packet, Publish, CONNACK_ACCEPTED, CONNACK_BAD_CREDENTIALS,
};
use propylon::mqtt::MqttProxy;
use propylon::spec::{load_objects, MqttProxySpec};
use propylon::{MemoryStore, Storage};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

fn broker_spec(port: u16) -> MqttProxySpec {
    // password "pass" in base64
    let yaml = format!(
        r#"
kind: MQTTProxy
name: broker-test
port: {port}
auth:
  - userName: tester
    passBase64: cGFzcw==
"#
    );
    load_objects(&yaml).unwrap()[0].decode().unwrap()
}

async fn start_broker(port: u16) -> (MqttProxy, Arc<MemoryStore>) {
    let storage = Arc::new(MemoryStore::new());
    let broker = MqttProxy::new(broker_spec(port), storage.clone())
        .await
        .expect("broker starts");
    (broker, storage)
}

struct MqttClient {
    framed: Framed<TcpStream, MqttCodec>,
}

impl MqttClient {
    async fn connect(port: u16, client_id: &str, clean: bool, password: &[u8]) -> (Self, u8, bool) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut framed = Framed::new(stream, MqttCodec);
        framed
            .send(Packet::Connect(Connect {
                client_id: client_id.to_string(),
                clean_session: clean,
                keep_alive: 0,
                username: Some("tester".to_string()),
                password: Some(password.to_vec()),
            }))
            .await
            .unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(2), framed.next())
            .await
            .expect("connack within deadline")
            .unwrap()
            .unwrap();
        let Packet::ConnAck {
            session_present,
            code,
        } = ack
        else {
            panic!("expected CONNACK, got {:?}", ack);
        };
        (Self { framed }, code, session_present)
    }

    async fn subscribe(&mut self, topic: &str, qos: u8) {
        self.framed
            .send(Packet::Subscribe {
                packet_id: 1,
                topics: vec![(topic.to_string(), qos)],
            })
            .await
            .unwrap();
        let ack = self.next_packet(Duration::from_secs(2)).await;
        assert!(matches!(ack, Packet::SubAck { .. }), "got {:?}", ack);
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, packet_id: u16) {
        self.framed
            .send(Packet::Publish(Publish {
                dup: false,
                qos,
                retain: false,
                topic: topic.to_string(),
                packet_id: (qos > 0).then_some(packet_id),
                payload: Bytes::copy_from_slice(payload),
            }))
            .await
            .unwrap();
        if qos > 0 {
            let ack = self.next_packet(Duration::from_secs(2)).await;
            assert!(matches!(ack, Packet::PubAck { .. }), "got {:?}", ack);
        }
    }

    async fn puback(&mut self, packet_id: u16) {
        self.framed
            .send(Packet::PubAck { packet_id })
            .await
            .unwrap();
    }

    async fn next_packet(&mut self, timeout: Duration) -> Packet {
        tokio::time::timeout(timeout, self.framed.next())
            .await
            .expect("packet within deadline")
            .expect("connection stays open")
            .expect("valid packet")
    }

    async fn expect_publish(&mut self, timeout: Duration) -> Publish {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("publish within deadline");
            if let Packet::Publish(publish) = self.next_packet(remaining).await {
                return publish;
            }
        }
    }
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let t = test_report!("CONNECT with a wrong password is refused");
    let port = free_tcp_port();
    let (broker, _storage) = start_broker(port).await;

    let (_client, code, _) = MqttClient::connect(port, "c-bad", true, b"wrong").await;
    t.assert_eq("connack code", &code, &CONNACK_BAD_CREDENTIALS);

    broker.close().await;
}

#[tokio::test]
async fn test_wildcard_routing_between_clients() {
    let t = test_report!("A publish reaches subscribers through wildcard filters");
    let port = free_tcp_port();
    let (broker, _storage) = start_broker(port).await;

    let (mut subscriber, code, _) = MqttClient::connect(port, "c-sub", true, b"pass").await;
    t.assert_eq("subscriber accepted", &code, &CONNACK_ACCEPTED);
    subscriber.subscribe("sensors/+/temp", 0).await;

    let (mut publisher, code, _) = MqttClient::connect(port, "c-pub", true, b"pass").await;
    t.assert_eq("publisher accepted", &code, &CONNACK_ACCEPTED);
    publisher.publish("sensors/room1/temp", b"21.5", 0, 0).await;

    let publish = subscriber.expect_publish(Duration::from_secs(2)).await;
    t.assert_eq("topic", &publish.topic.as_str(), &"sensors/room1/temp");
    t.assert_eq("payload", &&publish.payload[..], &b"21.5".as_slice());

    broker.close().await;
}

#[tokio::test]
async fn test_qos1_resend_until_puback_across_reconnect() {
    let t = test_report!("Unacked qos-1 messages are redelivered with the original id");
    let port = free_tcp_port();
    let (broker, _storage) = start_broker(port).await;

    let (mut subscriber, _, _) = MqttClient::connect(port, "c1", false, b"pass").await;
    subscriber.subscribe("t", 1).await;

    let (mut publisher, _, _) = MqttClient::connect(port, "c-pub", true, b"pass").await;
    publisher.publish("t", b"x", 1, 11).await;

    t.action("receive the first delivery but never acknowledge it");
    let first = subscriber.expect_publish(Duration::from_secs(2)).await;
    let original_id = first.packet_id.expect("qos-1 delivery carries an id");
    t.assert_eq("qos", &first.qos, &1u8);
    drop(subscriber);

    t.action("reconnect with the same clientId");
    let (mut subscriber, code, session_present) =
        MqttClient::connect(port, "c1", false, b"pass").await;
    t.assert_eq("accepted", &code, &CONNACK_ACCEPTED);
    t.assert_true("session resumed", session_present);

    let redelivered = subscriber.expect_publish(Duration::from_secs(2)).await;
    t.assert_eq(
        "redelivery keeps the packet id",
        &redelivered.packet_id,
        &Some(original_id),
    );
    t.assert_eq("payload", &&redelivered.payload[..], &b"x".as_slice());

    t.action("acknowledge and verify redelivery stops");
    subscriber.puback(original_id).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Drain anything in flight from before the ack landed.
    let mut late = 0;
    while let Ok(Some(Ok(Packet::Publish(_)))) =
        tokio::time::timeout(Duration::from_millis(150), subscriber.framed.next()).await
    {
        late += 1;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let quiet =
        tokio::time::timeout(Duration::from_millis(200), subscriber.framed.next()).await;
    t.assert_true("no redelivery after puback", quiet.is_err());
    t.assert_true("only a bounded backlog drained", late < 10);

    broker.close().await;
}

#[tokio::test]
async fn test_durable_session_restores_subscriptions() {
    let t = test_report!("cleanSession=false restores subscriptions on reconnect");
    let port = free_tcp_port();
    let (broker, storage) = start_broker(port).await;

    {
        let (mut subscriber, _, _) = MqttClient::connect(port, "c-durable", false, b"pass").await;
        subscriber.subscribe("news", 1).await;
        subscriber
            .framed
            .send(Packet::Disconnect)
            .await
            .unwrap();
    }
    let persisted = common::wait_until(Duration::from_secs(2), || {
        storage
            .get("/mqtt/sessionMgr/clientID/c-durable")
            .unwrap()
            .is_some_and(|v| v.contains("news"))
    })
    .await;
    t.assert_true("session snapshot persisted", persisted);

    let (mut subscriber, _, session_present) =
        MqttClient::connect(port, "c-durable", false, b"pass").await;
    t.assert_true("session resumed", session_present);

    let (mut publisher, _, _) = MqttClient::connect(port, "c-pub", true, b"pass").await;
    publisher.publish("news", b"hello again", 1, 21).await;

    let publish = subscriber.expect_publish(Duration::from_secs(2)).await;
    t.assert_eq("payload", &&publish.payload[..], &b"hello again".as_slice());
    if let Some(id) = publish.packet_id {
        subscriber.puback(id).await;
    }

    broker.close().await;
}

#[tokio::test]
async fn test_clean_session_forgets_subscriptions() {
    let t = test_report!("cleanSession=true starts from scratch every connect");
    let port = free_tcp_port();
    let (broker, storage) = start_broker(port).await;

    {
        let (mut subscriber, _, _) = MqttClient::connect(port, "c-clean", true, b"pass").await;
        subscriber.subscribe("news", 1).await;
        subscriber.framed.send(Packet::Disconnect).await.unwrap();
    }
    let forgotten = common::wait_until(Duration::from_secs(2), || {
        storage
            .get("/mqtt/sessionMgr/clientID/c-clean")
            .unwrap()
            .is_none()
    })
    .await;
    t.assert_true("snapshot removed from the store", forgotten);

    let (_subscriber, code, session_present) =
        MqttClient::connect(port, "c-clean", true, b"pass").await;
    t.assert_eq("accepted", &code, &CONNACK_ACCEPTED);
    t.assert_true("no session resumed", !session_present);

    broker.close().await;
}

#[tokio::test]
async fn test_http_side_channel_publish() {
    let t = test_report!("Broker-level publish reaches connected subscribers");
    let port = free_tcp_port();
    let (broker, _storage) = start_broker(port).await;

    let (mut subscriber, _, _) = MqttClient::connect(port, "c-side", true, b"pass").await;
    subscriber.subscribe("events/#", 0).await;

    broker.publish("events/deploy", Bytes::from_static(b"done"), 0);

    let publish = subscriber.expect_publish(Duration::from_secs(2)).await;
    t.assert_eq("topic", &publish.topic.as_str(), &"events/deploy");
    t.assert_eq("payload", &&publish.payload[..], &b"done".as_slice());

    broker.close().await;
}
