//! Connection state.
//!
//! The lifecycle flows:
//! - `Disconnected` -> `Connecting` (connect requested, transport opening)
//! - `Connecting` -> `Connected` (CONNACK accepted)
//! - `Connecting` -> `Disconnected` (timeout, refusal, transport failure)
//! - `Connected` -> `Disconnected` (transport lost or explicit disconnect)
//! - `Disconnected` -> `Reconnecting` -> `Connecting` (reconnect timer fired)

use std::fmt;

/// Current state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in flight. A reconnect timer may be pending.
    #[default]
    Disconnected,
    /// Transport opening or CONNECT sent, waiting for CONNACK.
    Connecting,
    /// CONNACK accepted. Publishing and subscribing are possible.
    Connected,
    /// A reconnect timer fired; the client is about to re-enter `Connecting`.
    Reconnecting,
}

impl ConnectionState {
    /// Short identifier for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while an attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
