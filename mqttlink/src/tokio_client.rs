//! Tokio runtime for [`Client`].
//!
//! One task owns the state machine and serializes everything that can touch
//! it: API commands from [`AsyncClient`] handles, socket events from the
//! connect and reader tasks, and timer deadlines. Logical time is the wall
//! time elapsed since the loop was created.
//!
//! ```no_run
//! use mqttlink::{ClientConfig, ConnectionState, Event, QoS};
//!
//! #[tokio::main]
//! async fn main() -> mqttlink::Result<()> {
//!     let config = ClientConfig::new("127.0.0.1", 1883).with_client_id("dev1");
//!     let (client, mut events) = mqttlink::spawn(config)?;
//!
//!     client.connect()?;
//!     client.wait_for_state(ConnectionState::Connected).await?;
//!     client.subscribe(&["sensors/#"], QoS::AtLeastOnce).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let Event::MessageReceived(msg) = event {
//!             println!("{}: {:?}", msg.topic, msg.payload);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeSet, VecDeque};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportCall, TransportEvent};
use crate::types::{Event, Message, QoS};

const READ_BUFFER_SIZE: usize = 4096;

/// Transport half handed to the state machine. Requests are queued and
/// carried out by the [`EventLoop`] after each state machine step.
#[derive(Debug, Default)]
pub struct TcpTransport {
    queued: VecDeque<TransportCall>,
}

impl TcpTransport {
    fn take_calls(&mut self) -> Vec<TransportCall> {
        self.queued.drain(..).collect()
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, host: &str, port: u16) {
        self.queued.push_back(TransportCall::Open {
            host: host.to_string(),
            port,
        });
    }

    fn write(&mut self, packet: Bytes) {
        self.queued.push_back(TransportCall::Write(packet));
    }

    fn close(&mut self) {
        self.queued.push_back(TransportCall::Close);
    }

    fn abort(&mut self) {
        self.queued.push_back(TransportCall::Abort);
    }
}

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Publish {
        message: Message,
        reply: oneshot::Sender<Result<Option<u16>>>,
    },
    Subscribe {
        filters: Vec<String>,
        qos: QoS,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    SubscribedTopics(oneshot::Sender<BTreeSet<String>>),
    Shutdown,
}

enum IoEvent {
    Connected(TcpStream),
    Data(Bytes),
    Closed,
    Error(String),
}

/// Cloneable handle to a running [`EventLoop`].
#[derive(Clone)]
pub struct AsyncClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl AsyncClient {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ClientClosed)
    }

    /// Start connecting. Progress is reported through events and
    /// [`AsyncClient::state`].
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Disconnect and wait until the DISCONNECT packet has been handed to
    /// the socket.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Disconnect(tx))?;
        rx.await.map_err(|_| Error::ClientClosed)
    }

    /// Publish a message. Returns the packet identifier for QoS 1.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        let message = Message::new(topic, payload).with_qos(qos).with_retain(retain);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish { message, reply })?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }

    pub async fn subscribe<S: AsRef<str>>(&self, filters: &[S], qos: QoS) -> Result<()> {
        let filters = filters.iter().map(|f| f.as_ref().to_string()).collect();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            filters,
            qos,
            reply,
        })?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }

    pub async fn unsubscribe<S: AsRef<str>>(&self, filters: &[S]) -> Result<()> {
        let filters = filters.iter().map(|f| f.as_ref().to_string()).collect();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { filters, reply })?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }

    pub async fn subscribed_topics(&self) -> Result<BTreeSet<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SubscribedTopics(tx))?;
        rx.await.map_err(|_| Error::ClientClosed)
    }

    /// Last state published by the event loop.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map_err(|_| Error::ClientClosed)?;
        Ok(())
    }

    /// Disconnect and stop the event loop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

/// Drives a [`Client`] over TCP.
pub struct EventLoop {
    client: Client<TcpTransport>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Sender<ConnectionState>,
    io_tx: mpsc::UnboundedSender<(u64, IoEvent)>,
    io_rx: mpsc::UnboundedReceiver<(u64, IoEvent)>,
    writer: Option<OwnedWriteHalf>,
    tasks: Vec<JoinHandle<()>>,
    /// Bumped whenever the socket is replaced or torn down; events from
    /// older sockets are dropped.
    generation: u64,
    started: Instant,
}

impl EventLoop {
    /// Build an event loop and its handle. Nothing runs until
    /// [`EventLoop::run`] is polled.
    pub fn new(
        config: ClientConfig,
    ) -> Result<(Self, AsyncClient, mpsc::UnboundedReceiver<Event>)> {
        let client = Client::new(config, TcpTransport::default())?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (io_tx, io_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            client,
            commands: cmd_rx,
            events: event_tx,
            state: state_tx,
            io_tx,
            io_rx,
            writer: None,
            tasks: Vec::new(),
            generation: 0,
            started: Instant::now(),
        };
        let handle = AsyncClient {
            commands: cmd_tx,
            state: state_rx,
        };
        Ok((event_loop, handle, event_rx))
    }

    /// Run until shut down or every [`AsyncClient`] handle is dropped.
    pub async fn run(mut self) {
        loop {
            self.step().await;

            let deadline = self
                .client
                .next_timer_deadline()
                .map(|at| self.started + at);
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some((generation, event)) = self.io_rx.recv() => {
                    self.handle_io(generation, event);
                }
                _ = timer => {}
            }
        }

        debug!("Event loop stopping");
        self.client.disconnect();
        self.flush().await;
        self.dispatch_events();
        self.teardown();
    }

    /// Fire due timers, perform queued I/O and publish events.
    async fn step(&mut self) {
        self.client.advance_to(self.started.elapsed());
        self.flush().await;
        self.dispatch_events();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.client.connect(),
            Command::Disconnect(reply) => {
                self.client.disconnect();
                self.step().await;
                let _ = reply.send(());
            }
            Command::Publish { message, reply } => {
                let _ = reply.send(self.client.publish_message(message));
            }
            Command::Subscribe {
                filters,
                qos,
                reply,
            } => {
                let _ = reply.send(self.client.subscribe(filters.as_slice(), qos));
            }
            Command::Unsubscribe { filters, reply } => {
                let _ = reply.send(self.client.unsubscribe(filters.as_slice()));
            }
            Command::SubscribedTopics(reply) => {
                let _ = reply.send(self.client.subscribed_topics());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_io(&mut self, generation: u64, event: IoEvent) {
        if generation != self.generation {
            trace!("Dropping event from stale connection {}", generation);
            return;
        }

        match event {
            IoEvent::Connected(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                let (reader, writer) = stream.into_split();
                self.writer = Some(writer);
                self.tasks.push(tokio::spawn(read_loop(
                    reader,
                    self.generation,
                    self.io_tx.clone(),
                )));
                self.client.handle_transport(TransportEvent::Opened);
            }
            IoEvent::Data(bytes) => self.client.handle_transport(TransportEvent::Data(bytes)),
            IoEvent::Closed => {
                self.writer = None;
                self.client.handle_transport(TransportEvent::Closed);
            }
            IoEvent::Error(reason) => {
                self.writer = None;
                self.client.handle_transport(TransportEvent::Error(reason));
            }
        }
    }

    async fn flush(&mut self) {
        for call in self.client.transport_mut().take_calls() {
            match call {
                TransportCall::Open { host, port } => {
                    self.teardown();
                    let generation = self.generation;
                    let io_tx = self.io_tx.clone();
                    self.tasks.push(tokio::spawn(async move {
                        let event = match TcpStream::connect((host.as_str(), port)).await {
                            Ok(stream) => IoEvent::Connected(stream),
                            Err(e) => IoEvent::Error(format!("connect {host}:{port}: {e}")),
                        };
                        let _ = io_tx.send((generation, event));
                    }));
                }
                TransportCall::Write(packet) => {
                    let Some(writer) = self.writer.as_mut() else {
                        trace!("Dropping {} byte write without a socket", packet.len());
                        continue;
                    };
                    if let Err(e) = writer.write_all(&packet).await {
                        warn!("Write failed: {}", e);
                        self.writer = None;
                        let _ = self
                            .io_tx
                            .send((self.generation, IoEvent::Error(e.to_string())));
                    }
                }
                TransportCall::Close => {
                    if let Some(mut writer) = self.writer.take() {
                        if let Err(e) = writer.shutdown().await {
                            debug!("Shutdown failed: {}", e);
                        }
                    }
                    self.teardown();
                }
                TransportCall::Abort => self.teardown(),
            }
        }
    }

    /// Drop the socket and every task tied to it.
    fn teardown(&mut self) {
        self.generation += 1;
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn dispatch_events(&mut self) {
        while let Some(event) = self.client.poll_event() {
            if let Event::StateChanged(state) = event {
                self.state.send_replace(state);
            }
            // The receiver may have been dropped; the loop keeps running.
            let _ = self.events.send(event);
        }
    }
}

async fn read_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    generation: u64,
    io_tx: mpsc::UnboundedSender<(u64, IoEvent)>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => IoEvent::Closed,
            Ok(_) => IoEvent::Data(buf.split().freeze()),
            Err(e) => IoEvent::Error(e.to_string()),
        };
        let done = !matches!(event, IoEvent::Data(_));
        if io_tx.send((generation, event)).is_err() || done {
            return;
        }
        buf.reserve(READ_BUFFER_SIZE);
    }
}

/// Spawn an [`EventLoop`] on the current tokio runtime.
pub fn spawn(config: ClientConfig) -> Result<(AsyncClient, mpsc::UnboundedReceiver<Event>)> {
    let (event_loop, client, events) = EventLoop::new(config)?;
    tokio::spawn(event_loop.run());
    Ok((client, events))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    use super::*;
    use crate::protocol::codec::{FixedHeader, take_frame};
    use crate::protocol::v4::Publish;

    const WAIT: Duration = Duration::from_secs(5);

    /// Log output for `cargo test -- --nocapture`; `RUST_LOG` picks the level.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> (FixedHeader, Bytes) {
        loop {
            if let Some(frame) = take_frame(buf) {
                return frame;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "client closed the connection");
        }
    }

    async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<Event>, mut pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event loop stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn config(port: u16) -> ClientConfig {
        ClientConfig::new("127.0.0.1", port)
            .with_client_id("dev1")
            .with_reconnect_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_publish_subscribe_round_trip() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();

            let (header, body) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 1);
            assert!(body.windows(4).any(|w| w == b"dev1"));
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let (header, body) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 8);
            let pkid = [body[0], body[1]];
            stream
                .write_all(&[0x90, 0x03, pkid[0], pkid[1], 0x01])
                .await
                .unwrap();

            let inbound = Publish {
                topic: "sensors/t2".to_string(),
                payload: Bytes::from_static(b"19.0"),
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: false,
                pkid: 7,
            };
            stream.write_all(&inbound.encode().unwrap()).await.unwrap();

            let (header, body) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 4);
            assert_eq!(&body[..], &[0x00, 0x07]);

            let (header, body) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 3);
            let publish = Publish::read(header.flags, &body).unwrap();
            assert_eq!(publish.topic, "sensors/t1");
            let [hi, lo] = publish.pkid.to_be_bytes();
            stream.write_all(&[0x40, 0x02, hi, lo]).await.unwrap();

            let (header, _) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 14);
        });

        let (client, mut events) = assert_ok!(spawn(config(port)));
        assert_ok!(client.connect());
        next_event(&mut events, |e| matches!(e, Event::Connected)).await;
        assert!(client.is_connected());

        assert_ok!(client.subscribe(&["sensors/#"], QoS::AtLeastOnce).await);
        let event = next_event(&mut events, |e| matches!(e, Event::MessageReceived(_))).await;
        match event {
            Event::MessageReceived(msg) => {
                assert_eq!(msg.topic, "sensors/t2");
                assert_eq!(msg.payload.as_ref(), b"19.0");
                assert_eq!(msg.qos, QoS::AtLeastOnce);
            }
            other => panic!("unexpected {other:?}"),
        }

        let pkid = assert_ok!(
            client
                .publish("sensors/t1", "23.5", QoS::AtLeastOnce, false)
                .await
        );
        let pkid = pkid.expect("qos 1 publish has a packet id");
        let event = next_event(&mut events, |e| matches!(e, Event::Published(_))).await;
        assert!(matches!(event, Event::Published(id) if id == pkid));

        assert_ok!(client.disconnect().await);
        assert_ok!(tokio::time::timeout(WAIT, broker).await).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            assert_ok!(client.subscribed_topics().await),
            BTreeSet::from(["sensors/#".to_string()])
        );
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            // first session: accept, ack, take the SUBSCRIBE, then drop
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            read_frame(&mut stream, &mut buf).await;
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let (header, _) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 8);
            drop(stream);

            // second session: the filter must come back unprompted
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let (header, _) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 1);
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let (header, body) = read_frame(&mut stream, &mut buf).await;
            assert_eq!(header.packet_type, 8);
            assert!(body.windows(5).any(|w| w == b"cmd/#"));
        });

        let (client, mut events) = assert_ok!(spawn(config(port)));
        assert_ok!(client.connect());
        assert_ok!(
            tokio::time::timeout(WAIT, client.wait_for_state(ConnectionState::Connected)).await
        )
        .unwrap();
        assert_ok!(client.subscribe(&["cmd/#"], QoS::AtMostOnce).await);

        next_event(&mut events, |e| matches!(e, Event::Disconnected)).await;
        next_event(&mut events, |e| {
            matches!(e, Event::StateChanged(ConnectionState::Reconnecting))
        })
        .await;
        next_event(&mut events, |e| matches!(e, Event::Connected)).await;

        assert_ok!(tokio::time::timeout(WAIT, broker).await).unwrap();
        assert_ok!(client.shutdown());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_transport_error() {
        init_tracing();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (client, mut events) =
            assert_ok!(spawn(config(port).with_auto_reconnect(false)));
        assert_ok!(client.connect());

        let event = next_event(&mut events, |e| matches!(e, Event::Error(_))).await;
        assert!(matches!(event, Event::Error(Error::Transport(_))));
        next_event(&mut events, |e| matches!(e, Event::Disconnected)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        init_tracing();
        let (client, mut events) = assert_ok!(spawn(config(1)));
        assert_ok!(client.shutdown());

        // the loop drops its event sender on exit
        tokio::time::timeout(WAIT, async { while events.recv().await.is_some() {} })
            .await
            .unwrap();
        assert!(matches!(
            client.publish("t", "x", QoS::AtMostOnce, false).await,
            Err(Error::ClientClosed)
        ));
    }
}
