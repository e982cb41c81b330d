//! Transport abstraction.
//!
//! The client drives a byte-stream transport through [`Transport`] and is fed
//! the transport's notifications as [`TransportEvent`]s. Implementations must
//! not call back into the client; they only record or perform the request.
//!
//! [`MemoryTransport`] is an in-memory implementation that records every
//! request so tests and embedding applications can inspect what was written.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Outbound side of a stream connection.
pub trait Transport {
    /// Begin opening a connection. Completion is reported with
    /// [`TransportEvent::Opened`] or [`TransportEvent::Error`].
    fn open(&mut self, host: &str, port: u16);

    /// Queue one complete packet for sending.
    fn write(&mut self, packet: Bytes);

    /// Flush and close gracefully.
    fn close(&mut self);

    /// Drop the connection immediately, discarding unsent data.
    fn abort(&mut self);
}

/// Notifications from the transport, fed into the client in the order they
/// happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The stream is open.
    Opened,
    /// Bytes arrived. Any chunking is allowed.
    Data(Bytes),
    /// The peer closed the stream.
    Closed,
    /// The stream failed (refused, unreachable, reset).
    Error(String),
}

/// A request the client made of a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open { host: String, port: u16 },
    Write(Bytes),
    Close,
    Abort,
}

/// Recording in-memory transport.
///
/// Clones share the same log, so a test can keep a handle while the client
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything requested so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Packets written so far, in order.
    pub fn written(&self) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drain and return the packets written so far.
    pub fn take_written(&self) -> Vec<Bytes> {
        let mut calls = self.calls.lock();
        let mut written = Vec::new();
        calls.retain(|call| match call {
            TransportCall::Write(bytes) => {
                written.push(bytes.clone());
                false
            }
            _ => true,
        });
        written
    }

    /// Number of `open` requests so far.
    pub fn open_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, TransportCall::Open { .. }))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, host: &str, port: u16) {
        self.calls.lock().push(TransportCall::Open {
            host: host.to_string(),
            port,
        });
    }

    fn write(&mut self, packet: Bytes) {
        self.calls.lock().push(TransportCall::Write(packet));
    }

    fn close(&mut self) {
        self.calls.lock().push(TransportCall::Close);
    }

    fn abort(&mut self) {
        self.calls.lock().push(TransportCall::Abort);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_records_calls() {
        let handle = MemoryTransport::new();
        let mut transport = handle.clone();

        transport.open("broker", 1883);
        transport.write(Bytes::from_static(b"\xC0\x00"));
        transport.abort();

        assert_eq!(handle.open_count(), 1);
        assert_eq!(handle.written(), vec![Bytes::from_static(b"\xC0\x00")]);
        assert_eq!(handle.take_written().len(), 1);
        assert!(handle.written().is_empty());
        assert_eq!(
            handle.calls(),
            vec![
                TransportCall::Open {
                    host: "broker".to_string(),
                    port: 1883
                },
                TransportCall::Abort
            ]
        );
    }
}
