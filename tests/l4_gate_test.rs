//! L4 gate tests: TCP pumping and UDP session handling against echo
//! upstreams.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{free_tcp_port, free_udp_port};
use propylon::gate::GateState;
use propylon::spec::{load_objects, TcpServerSpec, UdpServerSpec};
use propylon::{TcpServer, UdpServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// TCP echo upstream on an ephemeral port.
async fn spawn_tcp_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP echo upstream on an ephemeral port.
async fn spawn_udp_echo() -> std::net::SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

fn tcp_spec(port: u16, upstream: std::net::SocketAddr) -> TcpServerSpec {
    let yaml = format!(
        r#"
kind: TCPServer
name: tcp-gate
port: {port}
pool:
  servers:
    - url: tcp://{upstream}
"#
    );
    load_objects(&yaml).unwrap()[0].decode().unwrap()
}

fn udp_spec(port: u16, upstream: std::net::SocketAddr, idle: &str, duplex: bool) -> UdpServerSpec {
    let yaml = format!(
        r#"
kind: UDPServer
name: udp-gate
port: {port}
downstreamIdleTimeout: {idle}
upstreamIdleTimeout: 2s
duplex: {duplex}
pool:
  servers:
    - url: udp://{upstream}
"#
    );
    load_objects(&yaml).unwrap()[0].decode().unwrap()
}

#[tokio::test]
async fn test_tcp_gate_pumps_both_directions() {
    let t = test_report!("Bytes flow downstream->upstream and back through the TCP gate");
    let upstream = spawn_tcp_echo().await;
    let port = free_tcp_port();
    let gate = TcpServer::new(tcp_spec(port, upstream)).unwrap();
    gate.wait_for(GateState::Running, Duration::from_secs(5))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping over tcp").await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("echo within deadline")
        .unwrap();
    t.assert_eq("echoed bytes", &&buf[..n], &b"ping over tcp".as_slice());

    // A second exchange reuses the same session.
    client.write_all(b"again").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("second echo within deadline")
        .unwrap();
    t.assert_eq("second echo", &&buf[..n], &b"again".as_slice());

    gate.close().await;
    t.assert_eq("gate closed", &gate.state(), &GateState::Closed);
}

#[tokio::test]
async fn test_udp_duplex_session_round_trip() {
    let t = test_report!("UDP reply returns verbatim to the original downstream address");
    let upstream = spawn_udp_echo().await;
    let port = free_udp_port();
    let gate = UdpServer::new(udp_spec(port, upstream, "60s", true)).unwrap();
    gate.wait_for(GateState::Running, Duration::from_secs(5))
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(("127.0.0.1", port)).await.unwrap();
    client.send(b"datagram one").await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    t.assert_eq("reply verbatim", &&buf[..n], &b"datagram one".as_slice());

    gate.close().await;
}

#[tokio::test]
async fn test_udp_one_shot_discards_replies() {
    let t = test_report!("One-shot sessions forward upstream but drop replies");
    let upstream = spawn_udp_echo().await;
    let port = free_udp_port();
    let gate = UdpServer::new(udp_spec(port, upstream, "60s", false)).unwrap();
    gate.wait_for(GateState::Running, Duration::from_secs(5))
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(("127.0.0.1", port)).await.unwrap();
    client.send(b"no reply expected").await.unwrap();

    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(500), client.recv(&mut buf)).await;
    t.assert_true("no reply forwarded", reply.is_err());

    gate.close().await;
}

#[tokio::test]
async fn test_udp_session_expires_after_idle() {
    let t = test_report!("Idle sessions close and a new one forms transparently");
    let upstream = spawn_udp_echo().await;
    let port = free_udp_port();
    let gate = UdpServer::new(udp_spec(port, upstream, "200ms", true)).unwrap();
    gate.wait_for(GateState::Running, Duration::from_secs(5))
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(("127.0.0.1", port)).await.unwrap();

    client.send(b"first").await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("first reply")
        .unwrap();
    t.assert_eq("first reply", &&buf[..n], &b"first".as_slice());

    t.action("sleep past downstreamIdleTimeout");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The old session has expired; traffic still flows on a fresh one.
    client.send(b"second").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("second reply after expiry")
        .unwrap();
    t.assert_eq("second reply", &&buf[..n], &b"second".as_slice());

    gate.close().await;
}
