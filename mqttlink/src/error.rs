//! Error types for mqttlink.

use std::io;

use crate::types::{ConnectReturnCode, QoS};

/// Result type alias for mqttlink.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Transport reported a failure (refused, unreachable, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection refused by broker.
    #[error("connection refused: {}", .0.reason())]
    ConnectionRefused(ConnectReturnCode),

    /// No CONNACK within the configured connect timeout.
    #[error("connection timeout")]
    ConnectTimeout,

    /// Operation requires an established session.
    #[error("not connected")]
    NotConnected,

    /// Topic name or filter is not acceptable.
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    /// UTF-8 string or binary field exceeds the 2-byte length prefix.
    #[error("string too long: {0} bytes (max 65535)")]
    StringTooLong(usize),

    /// Remaining length exceeds 268,435,455.
    #[error("packet too large: remaining length {0}")]
    PacketTooLarge(usize),

    /// QoS level this client does not implement.
    #[error("unsupported qos: {0:?}")]
    UnsupportedQoS(QoS),

    /// Inbound packet body could not be parsed.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Every packet identifier is held by an unacknowledged publish.
    #[error("packet identifiers exhausted")]
    PacketIdsExhausted,

    /// Reconnect policy gave up.
    #[error("reconnect attempts exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The runtime event loop is gone.
    #[error("client closed")]
    ClientClosed,
}
