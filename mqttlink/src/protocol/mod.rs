//! MQTT 3.1.1 protocol encoding and decoding.

pub mod codec;
pub mod v4;

pub use codec::*;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
