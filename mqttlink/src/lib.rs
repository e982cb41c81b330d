//! Resilient MQTT 3.1.1 client with QoS 0/1 delivery.
//!
//! The crate is split in two layers:
//!
//! - [`Client`]: a sans-IO state machine. It encodes and decodes packets,
//!   tracks subscriptions and unacknowledged publishes, and runs keep-alive,
//!   connect-timeout and reconnect timers on a logical clock. It talks to the
//!   network only through the [`Transport`] trait.
//! - [`AsyncClient`] / [`EventLoop`]: a tokio runtime that drives a
//!   [`Client`] over TCP on a single task.
//!
//! ## Connection lifecycle
//!
//! `Disconnected -> Connecting -> Connected`, and on loss
//! `Disconnected -> Reconnecting -> Connecting` every
//! [`ClientConfig::reconnect_interval`] while auto-reconnect is on.
//! Subscriptions are replayed after every accepted CONNACK.
//!
//! ## Example
//!
//! ```no_run
//! use mqttlink::{ClientConfig, Event, QoS};
//!
//! #[tokio::main]
//! async fn main() -> mqttlink::Result<()> {
//!     let (client, mut events) = mqttlink::spawn(ClientConfig::new("127.0.0.1", 1883))?;
//!     client.connect()?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             Event::Connected => {
//!                 client.subscribe(&["sensors/#"], QoS::AtLeastOnce).await?;
//!                 client.publish("sensors/t1", "23.5", QoS::AtLeastOnce, false).await?;
//!             }
//!             Event::MessageReceived(msg) => println!("{}: {:?}", msg.topic, msg.payload),
//!             other => println!("{other:?}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;
pub mod protocol;
pub mod scheduler;
mod session;
mod state;
mod tokio_client;
pub mod transport;
mod types;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_PORT, LastWill, generate_client_id};
pub use error::{Error, Result};
pub use session::{PacketIdAllocator, PendingPublish, Session};
pub use state::ConnectionState;
pub use tokio_client::{AsyncClient, EventLoop, TcpTransport, spawn};
pub use transport::{MemoryTransport, Transport, TransportCall, TransportEvent};
pub use types::{ConnectReturnCode, Event, Message, PacketType, QoS, SubscribeReturnCode};
