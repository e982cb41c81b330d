//! MQTT 3.1.1 (v4) packets.
//!
//! Outbound packets encode into a single `Bytes` frame so the transport can
//! write each packet in one call. Inbound packets are decoded from a frame
//! body produced by [`take_frame`](super::codec::take_frame).

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{ConnectReturnCode, PacketType, QoS, SubscribeReturnCode};

use super::codec::{
    FixedHeader, read_string, read_u16, string_len, variable_int_len, write_binary,
    write_fixed_header, write_string,
};
use super::{PROTOCOL_LEVEL, PROTOCOL_NAME};

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

const PUBLISH_RETAIN: u8 = 0x01;
const PUBLISH_DUP: u8 = 0x08;

/// Allocate a buffer for a frame with the given body length.
fn frame_buffer(remaining_len: usize) -> BytesMut {
    BytesMut::with_capacity(1 + variable_int_len(remaining_len as u32) + remaining_len)
}

/// Last Will and Testament.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT packet.
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<Will>,
}

impl Connect {
    /// Connect-flags byte.
    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(ref will) = self.will {
            flags |= FLAG_WILL;
            flags |= ((will.qos as u8) & 0x03) << 3;
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        flags
    }

    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep alive
        let mut len = string_len(PROTOCOL_NAME.len()) + 1 + 1 + 2;
        len += string_len(self.client_id.len());

        if let Some(ref will) = self.will {
            len += string_len(will.topic.len());
            len += string_len(will.payload.len());
        }
        if let Some(ref username) = self.username {
            len += string_len(username.len());
        }
        if let Some(ref password) = self.password {
            len += string_len(password.len());
        }

        len
    }

    pub fn encode(&self) -> Result<Bytes> {
        let remaining_len = self.remaining_length();
        let mut buf = frame_buffer(remaining_len);

        write_fixed_header(&mut buf, PacketType::Connect as u8, 0, remaining_len)?;

        // Variable header
        write_string(&mut buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);
        buf.put_u8(self.flags());
        buf.put_u16(self.keep_alive);

        // Payload
        write_string(&mut buf, &self.client_id)?;
        if let Some(ref will) = self.will {
            write_string(&mut buf, &will.topic)?;
            write_binary(&mut buf, &will.payload)?;
        }
        if let Some(ref username) = self.username {
            write_string(&mut buf, username)?;
        }
        if let Some(ref password) = self.password {
            write_string(&mut buf, password)?;
        }

        Ok(buf.freeze())
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Zero for QoS 0.
    pub pkid: u16,
}

impl Publish {
    /// Low nibble of the fixed header.
    pub fn flags(&self) -> u8 {
        let mut flags = ((self.qos as u8) & 0x03) << 1;
        if self.retain {
            flags |= PUBLISH_RETAIN;
        }
        if self.dup {
            flags |= PUBLISH_DUP;
        }
        flags
    }

    fn remaining_length(&self) -> usize {
        let mut len = string_len(self.topic.len()) + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }

    pub fn encode(&self) -> Result<Bytes> {
        let remaining_len = self.remaining_length();
        let mut buf = frame_buffer(remaining_len);

        write_fixed_header(&mut buf, PacketType::Publish as u8, self.flags(), remaining_len)?;
        write_string(&mut buf, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            buf.put_u16(self.pkid);
        }
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Parse a PUBLISH body.
    pub fn read(flags: u8, body: &[u8]) -> Result<Self> {
        let qos = QoS::from_u8((flags >> 1) & 0x03)
            .ok_or(Error::MalformedPacket("publish qos 3"))?;
        let retain = flags & PUBLISH_RETAIN != 0;
        let dup = flags & PUBLISH_DUP != 0;

        let (topic, mut pos) =
            read_string(body).ok_or(Error::MalformedPacket("publish topic"))?;

        let pkid = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..]).ok_or(Error::MalformedPacket("publish packet id"))?;
            pos += 2;
            id
        } else {
            0
        };

        let payload = Bytes::copy_from_slice(&body[pos..]);

        Ok(Publish { topic, payload, qos, retain, dup, pkid })
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<(String, QoS)>,
}

impl Subscribe {
    fn remaining_length(&self) -> usize {
        2 + self
            .filters
            .iter()
            .map(|(path, _)| string_len(path.len()) + 1)
            .sum::<usize>()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let remaining_len = self.remaining_length();
        let mut buf = frame_buffer(remaining_len);

        // Subscribe has fixed flags of 0x02
        write_fixed_header(&mut buf, PacketType::Subscribe as u8, 0x02, remaining_len)?;
        buf.put_u16(self.pkid);
        for (path, qos) in &self.filters {
            write_string(&mut buf, path)?;
            buf.put_u8(*qos as u8);
        }

        Ok(buf.freeze())
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    fn remaining_length(&self) -> usize {
        2 + self.topics.iter().map(|t| string_len(t.len())).sum::<usize>()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let remaining_len = self.remaining_length();
        let mut buf = frame_buffer(remaining_len);

        // Unsubscribe has fixed flags of 0x02
        write_fixed_header(&mut buf, PacketType::Unsubscribe as u8, 0x02, remaining_len)?;
        buf.put_u16(self.pkid);
        for topic in &self.topics {
            write_string(&mut buf, topic)?;
        }

        Ok(buf.freeze())
    }
}

/// PUBACK for an inbound QoS 1 publish.
pub fn puback(pkid: u16) -> Bytes {
    let [hi, lo] = pkid.to_be_bytes();
    Bytes::copy_from_slice(&[(PacketType::PubAck as u8) << 4, 0x02, hi, lo])
}

/// PINGREQ.
pub fn pingreq() -> Bytes {
    Bytes::from_static(&[(PacketType::PingReq as u8) << 4, 0x00])
}

/// DISCONNECT.
pub fn disconnect() -> Bytes {
    Bytes::from_static(&[(PacketType::Disconnect as u8) << 4, 0x00])
}

/// CONNACK body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn read(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(Error::MalformedPacket("short connack"));
        }

        Ok(ConnAck {
            session_present: body[0] & 0x01 != 0,
            code: ConnectReturnCode::from_u8(body[1]),
        })
    }
}

/// SUBACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl SubAck {
    pub fn read(body: &[u8]) -> Result<Self> {
        if body.len() < 3 {
            return Err(Error::MalformedPacket("short suback"));
        }

        let pkid = read_u16(body).ok_or(Error::MalformedPacket("suback packet id"))?;
        let return_codes = body[2..]
            .iter()
            .map(|&b| SubscribeReturnCode::from_u8(b))
            .collect();

        Ok(SubAck { pkid, return_codes })
    }
}

/// Inbound packet as seen by the client.
#[derive(Debug, Clone)]
pub enum Incoming {
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    SubAck(SubAck),
    UnsubAck(u16),
    PingResp,
    /// Any type the client does not handle; carries the raw type nibble.
    Unknown(u8),
}

impl Incoming {
    /// Decode a frame body according to its fixed header.
    pub fn read(header: &FixedHeader, body: &[u8]) -> Result<Self> {
        let packet = match PacketType::from_u8(header.packet_type) {
            Some(PacketType::ConnAck) => Incoming::ConnAck(ConnAck::read(body)?),
            Some(PacketType::Publish) => Incoming::Publish(Publish::read(header.flags, body)?),
            Some(PacketType::PubAck) => {
                Incoming::PubAck(read_u16(body).ok_or(Error::MalformedPacket("short puback"))?)
            }
            Some(PacketType::SubAck) => Incoming::SubAck(SubAck::read(body)?),
            Some(PacketType::UnsubAck) => {
                Incoming::UnsubAck(read_u16(body).ok_or(Error::MalformedPacket("short unsuback"))?)
            }
            Some(PacketType::PingResp) => Incoming::PingResp,
            _ => Incoming::Unknown(header.packet_type),
        };
        Ok(packet)
    }
}
