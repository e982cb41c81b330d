//! Common types for mqttlink.

use bytes::Bytes;
use serde::Deserialize;

use crate::error::Error;
use crate::state::ConnectionState;

/// Quality of Service level.
///
/// Only `AtMostOnce` and `AtLeastOnce` get acknowledgement tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged with PUBACK).
    AtLeastOnce = 1,
    /// Exactly once delivery (not implemented on the publish path).
    ExactlyOnce = 2,
}

impl QoS {
    /// Decode the two QoS bits. Returns `None` for the reserved value 3.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        QoS::from_u8(value).ok_or_else(|| format!("invalid qos {value}"))
    }
}

/// MQTT 3.1.1 control packet types (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        })
    }
}

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernamePassword,
    NotAuthorized,
    Unknown(u8),
}

impl ConnectReturnCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::UnacceptableProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernamePassword,
            5 => ConnectReturnCode::NotAuthorized,
            other => ConnectReturnCode::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernamePassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Unknown(code) => code,
        }
    }

    /// Human-readable refusal reason.
    pub fn reason(&self) -> String {
        match self {
            ConnectReturnCode::Accepted => "accepted".to_string(),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                "unacceptable protocol version".to_string()
            }
            ConnectReturnCode::IdentifierRejected => "identifier rejected".to_string(),
            ConnectReturnCode::ServerUnavailable => "server unavailable".to_string(),
            ConnectReturnCode::BadUsernamePassword => "bad username or password".to_string(),
            ConnectReturnCode::NotAuthorized => "not authorized".to_string(),
            ConnectReturnCode::Unknown(code) => format!("unknown error: {code}"),
        }
    }
}

/// SUBACK per-topic return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Self {
        if value & 0x80 != 0 {
            return SubscribeReturnCode::Failure;
        }
        match QoS::from_u8(value) {
            Some(qos) => SubscribeReturnCode::Success(qos),
            None => SubscribeReturnCode::Failure,
        }
    }
}

/// MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery QoS.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set QoS level.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Notification emitted by the client, in the order the underlying
/// operations and bytes were processed.
#[derive(Debug)]
pub enum Event {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// CONNACK accepted; the session is usable.
    Connected,
    /// An active or in-progress session ended.
    Disconnected,
    /// Inbound PUBLISH delivered.
    MessageReceived(Message),
    /// PUBACK received for the packet identifier.
    Published(u16),
    /// Something failed; the client stays usable.
    Error(Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_connect_return_code_reasons() {
        assert_eq!(ConnectReturnCode::from_u8(0), ConnectReturnCode::Accepted);
        assert_eq!(
            ConnectReturnCode::from_u8(4).reason(),
            "bad username or password"
        );
        assert_eq!(ConnectReturnCode::from_u8(5).reason(), "not authorized");
        assert_eq!(ConnectReturnCode::from_u8(42).reason(), "unknown error: 42");
        assert_eq!(ConnectReturnCode::Unknown(42).to_u8(), 42);
    }

    #[test]
    fn test_subscribe_return_code() {
        assert_eq!(
            SubscribeReturnCode::from_u8(1),
            SubscribeReturnCode::Success(QoS::AtLeastOnce)
        );
        assert_eq!(SubscribeReturnCode::from_u8(0x80), SubscribeReturnCode::Failure);
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("a/b", "hi")
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true);
        assert_eq!(msg.topic, "a/b");
        assert_eq!(msg.payload.as_ref(), b"hi");
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert!(msg.retain);
    }
}
