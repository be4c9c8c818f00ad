//! MQTT 3.1.1 packet codec over a framed TCP transport.
//!
//! Covers the control packets the broker speaks: CONNECT/CONNACK,
//! PUBLISH/PUBACK (qos 0 and 1), SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK,
//! PINGREQ/PINGRESP and DISCONNECT. Qos 2 frames decode but are rejected at
//! the session layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// CONNACK return code: connection accepted.
pub const CONNACK_ACCEPTED: u8 = 0;
/// CONNACK return code: bad user name or password.
pub const CONNACK_BAD_CREDENTIALS: u8 = 4;
/// CONNACK return code: not authorized.
pub const CONNACK_NOT_AUTHORIZED: u8 = 5;

/// A decoded MQTT control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck {
        session_present: bool,
        code: u8,
    },
    Publish(Publish),
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        topics: Vec<(String, u8)>,
    },
    SubAck {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        topics: Vec<String>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNACK: u8 = 2;
const TYPE_PUBLISH: u8 = 3;
const TYPE_PUBACK: u8 = 4;
const TYPE_SUBSCRIBE: u8 = 8;
const TYPE_SUBACK: u8 = 9;
const TYPE_UNSUBSCRIBE: u8 = 10;
const TYPE_UNSUBACK: u8 = 11;
const TYPE_PINGREQ: u8 = 12;
const TYPE_PINGRESP: u8 = 13;
const TYPE_DISCONNECT: u8 = 14;

/// Framed codec for [`Packet`].
#[derive(Debug, Default)]
pub struct MqttCodec;

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 2 {
            return Ok(None);
        }

        // Remaining-length varint, at most 4 bytes.
        let mut remaining: usize = 0;
        let mut shift = 0u32;
        let mut header_len = 1;
        loop {
            let Some(&byte) = src.get(header_len) else {
                return Ok(None);
            };
            remaining |= ((byte & 0x7f) as usize) << shift;
            header_len += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 21 {
                return Err(Error::mqtt("remaining length varint too long"));
            }
        }

        if src.len() < header_len + remaining {
            src.reserve(header_len + remaining - src.len());
            return Ok(None);
        }

        let first = src[0];
        src.advance(header_len);
        let mut body = src.split_to(remaining).freeze();
        let packet = parse_packet(first, &mut body)?;
        Ok(Some(packet))
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let (first, body) = serialize_packet(&packet)?;
        dst.put_u8(first);
        put_remaining_length(dst, body.len())?;
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn put_remaining_length(dst: &mut BytesMut, mut len: usize) -> Result<()> {
    if len > 268_435_455 {
        return Err(Error::mqtt("packet too large"));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn read_u16(body: &mut Bytes) -> Result<u16> {
    if body.len() < 2 {
        return Err(Error::mqtt("truncated packet"));
    }
    Ok(body.get_u16())
}

fn read_string(body: &mut Bytes) -> Result<String> {
    let bytes = read_bytes(body)?;
    String::from_utf8(bytes).map_err(|_| Error::mqtt("string is not utf-8"))
}

fn read_bytes(body: &mut Bytes) -> Result<Vec<u8>> {
    let len = read_u16(body)? as usize;
    if body.len() < len {
        return Err(Error::mqtt("truncated packet"));
    }
    Ok(body.split_to(len).to_vec())
}

fn parse_packet(first: u8, body: &mut Bytes) -> Result<Packet> {
    let packet_type = first >> 4;
    match packet_type {
        TYPE_CONNECT => parse_connect(body),
        TYPE_CONNACK => {
            let flags = if body.is_empty() { 0 } else { body.get_u8() };
            let code = if body.is_empty() { 0 } else { body.get_u8() };
            Ok(Packet::ConnAck {
                session_present: flags & 0x01 != 0,
                code,
            })
        }
        TYPE_PUBLISH => {
            let dup = first & 0x08 != 0;
            let qos = (first >> 1) & 0x03;
            let retain = first & 0x01 != 0;
            if qos > 2 {
                return Err(Error::mqtt("invalid qos"));
            }
            let topic = read_string(body)?;
            let packet_id = if qos > 0 { Some(read_u16(body)?) } else { None };
            Ok(Packet::Publish(Publish {
                dup,
                qos,
                retain,
                topic,
                packet_id,
                payload: body.clone(),
            }))
        }
        TYPE_PUBACK => Ok(Packet::PubAck {
            packet_id: read_u16(body)?,
        }),
        TYPE_SUBSCRIBE => {
            let packet_id = read_u16(body)?;
            let mut topics = Vec::new();
            while !body.is_empty() {
                let topic = read_string(body)?;
                if body.is_empty() {
                    return Err(Error::mqtt("subscribe entry is missing qos"));
                }
                let qos = body.get_u8() & 0x03;
                topics.push((topic, qos));
            }
            if topics.is_empty() {
                return Err(Error::mqtt("subscribe without topics"));
            }
            Ok(Packet::Subscribe { packet_id, topics })
        }
        TYPE_SUBACK => {
            let packet_id = read_u16(body)?;
            Ok(Packet::SubAck {
                packet_id,
                codes: body.to_vec(),
            })
        }
        TYPE_UNSUBSCRIBE => {
            let packet_id = read_u16(body)?;
            let mut topics = Vec::new();
            while !body.is_empty() {
                topics.push(read_string(body)?);
            }
            if topics.is_empty() {
                return Err(Error::mqtt("unsubscribe without topics"));
            }
            Ok(Packet::Unsubscribe { packet_id, topics })
        }
        TYPE_UNSUBACK => Ok(Packet::UnsubAck {
            packet_id: read_u16(body)?,
        }),
        TYPE_PINGREQ => Ok(Packet::PingReq),
        TYPE_PINGRESP => Ok(Packet::PingResp),
        TYPE_DISCONNECT => Ok(Packet::Disconnect),
        other => Err(Error::mqtt(format!("unsupported packet type {}", other))),
    }
}

fn parse_connect(body: &mut Bytes) -> Result<Packet> {
    let protocol = read_string(body)?;
    if protocol != "MQTT" && protocol != "MQIsdp" {
        return Err(Error::mqtt(format!("unknown protocol {:?}", protocol)));
    }
    if body.is_empty() {
        return Err(Error::mqtt("truncated connect"));
    }
    let _level = body.get_u8();
    if body.is_empty() {
        return Err(Error::mqtt("truncated connect"));
    }
    let flags = body.get_u8();
    let keep_alive = read_u16(body)?;

    let clean_session = flags & 0x02 != 0;
    let has_will = flags & 0x04 != 0;
    let has_password = flags & 0x40 != 0;
    let has_username = flags & 0x80 != 0;

    let client_id = read_string(body)?;
    if has_will {
        let _will_topic = read_string(body)?;
        let _will_message = read_bytes(body)?;
    }
    let username = if has_username {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if has_password {
        Some(read_bytes(body)?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        client_id,
        clean_session,
        keep_alive,
        username,
        password,
    }))
}

fn serialize_packet(packet: &Packet) -> Result<(u8, Vec<u8>)> {
    let mut body = Vec::new();
    let first = match packet {
        Packet::Connect(connect) => {
            put_string(&mut body, "MQTT");
            body.push(4); // protocol level 3.1.1
            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            body.push(flags);
            body.extend_from_slice(&connect.keep_alive.to_be_bytes());
            put_string(&mut body, &connect.client_id);
            if let Some(username) = &connect.username {
                put_string(&mut body, username);
            }
            if let Some(password) = &connect.password {
                put_bytes(&mut body, password);
            }
            TYPE_CONNECT << 4
        }
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.push(u8::from(*session_present));
            body.push(*code);
            TYPE_CONNACK << 4
        }
        Packet::Publish(publish) => {
            put_string(&mut body, &publish.topic);
            if publish.qos > 0 {
                let id = publish
                    .packet_id
                    .ok_or_else(|| Error::mqtt("qos>0 publish needs a packet id"))?;
                body.extend_from_slice(&id.to_be_bytes());
            }
            body.extend_from_slice(&publish.payload);
            let mut first = TYPE_PUBLISH << 4;
            if publish.dup {
                first |= 0x08;
            }
            first |= (publish.qos & 0x03) << 1;
            if publish.retain {
                first |= 0x01;
            }
            first
        }
        Packet::PubAck { packet_id } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            TYPE_PUBACK << 4
        }
        Packet::Subscribe { packet_id, topics } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            for (topic, qos) in topics {
                put_string(&mut body, topic);
                body.push(*qos);
            }
            (TYPE_SUBSCRIBE << 4) | 0x02
        }
        Packet::SubAck { packet_id, codes } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            body.extend_from_slice(codes);
            TYPE_SUBACK << 4
        }
        Packet::Unsubscribe { packet_id, topics } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            for topic in topics {
                put_string(&mut body, topic);
            }
            (TYPE_UNSUBSCRIBE << 4) | 0x02
        }
        Packet::UnsubAck { packet_id } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            TYPE_UNSUBACK << 4
        }
        Packet::PingReq => TYPE_PINGREQ << 4,
        Packet::PingResp => TYPE_PINGRESP << 4,
        Packet::Disconnect => TYPE_DISCONNECT << 4,
    };
    Ok((first, body))
}

fn put_string(body: &mut Vec<u8>, value: &str) {
    put_bytes(body, value.as_bytes());
}

fn put_bytes(body: &mut Vec<u8>, value: &[u8]) {
    body.extend_from_slice(&(value.len() as u16).to_be_bytes());
    body.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) -> Packet {
        let mut codec = MqttCodec;
        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_connect_roundtrip() {
        let packet = Packet::Connect(Connect {
            client_id: "c1".to_string(),
            clean_session: false,
            keep_alive: 30,
            username: Some("alice".to_string()),
            password: Some(b"secret".to_vec()),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn test_publish_qos1_roundtrip() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: 1,
            retain: false,
            topic: "t".to_string(),
            packet_id: Some(7),
            payload: Bytes::from_static(b"x"),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn test_publish_qos0_has_no_packet_id() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: 0,
            retain: true,
            topic: "a/b".to_string(),
            packet_id: None,
            payload: Bytes::from_static(b"payload"),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn test_subscribe_roundtrip() {
        let packet = Packet::Subscribe {
            packet_id: 3,
            topics: vec![("t".to_string(), 1), ("a/#".to_string(), 0)],
        };
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn test_control_packets_roundtrip() {
        for packet in [
            Packet::PubAck { packet_id: 9 },
            Packet::SubAck {
                packet_id: 3,
                codes: vec![1, 0],
            },
            Packet::Unsubscribe {
                packet_id: 4,
                topics: vec!["t".to_string()],
            },
            Packet::UnsubAck { packet_id: 4 },
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
            Packet::ConnAck {
                session_present: true,
                code: CONNACK_ACCEPTED,
            },
        ] {
            assert_eq!(roundtrip(packet.clone()), packet);
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = MqttCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Packet::Publish(Publish {
                    dup: false,
                    qos: 0,
                    retain: false,
                    topic: "t".to_string(),
                    packet_id: None,
                    payload: Bytes::from_static(b"hello"),
                }),
                &mut buf,
            )
            .unwrap();

        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_large_remaining_length() {
        let payload = vec![0u8; 200];
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: 0,
            retain: false,
            topic: "big".to_string(),
            packet_id: None,
            payload: Bytes::from(payload),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn test_garbage_rejected() {
        let mut codec = MqttCodec;
        let mut buf = BytesMut::from(&[0xf0u8, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
