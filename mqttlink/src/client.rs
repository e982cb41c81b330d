//! MQTT 3.1.1 client state machine.
//!
//! [`Client`] performs no I/O of its own. The owner feeds it transport
//! notifications ([`Client::handle_transport`]) and elapsed time
//! ([`Client::advance`]); the client writes packets through its
//! [`Transport`] and queues [`Event`]s for the owner to drain.
//!
//! ```no_run
//! use mqttlink::{Client, ClientConfig, MemoryTransport, QoS, TransportEvent};
//!
//! let config = ClientConfig::new("broker.local", 1883).with_client_id("dev1");
//! let mut client = Client::new(config, MemoryTransport::new())?;
//!
//! client.connect();
//! client.handle_transport(TransportEvent::Opened);
//! // ... CONNACK arrives as TransportEvent::Data ...
//! client.publish("sensors/t1", "23.5", QoS::AtLeastOnce, false)?;
//!
//! while let Some(event) = client.poll_event() {
//!     println!("{event:?}");
//! }
//! # Ok::<(), mqttlink::Error>(())
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, validate_topic_filter, validate_topic_name};
use crate::error::{Error, Result};
use crate::protocol::codec::take_frame;
use crate::protocol::v4::{self, Connect, Incoming, Publish, Subscribe, Unsubscribe, Will};
use crate::scheduler::{Scheduler, Timer};
use crate::session::{PendingPublish, Session};
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportEvent};
use crate::types::{ConnectReturnCode, Event, Message, QoS, SubscribeReturnCode};

/// Event-driven MQTT client over an abstract transport.
pub struct Client<T: Transport> {
    config: ClientConfig,
    transport: T,
    state: ConnectionState,
    session: Session,
    scheduler: Scheduler,
    read_buf: BytesMut,
    events: VecDeque<Event>,
    reconnect_attempts: u32,
}

impl<T: Transport> Client<T> {
    /// Create a disconnected client. Fills in a generated client ID if the
    /// config has none.
    pub fn new(mut config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        config.ensure_client_id();

        Ok(Self {
            config,
            transport,
            state: ConnectionState::Disconnected,
            session: Session::new(),
            scheduler: Scheduler::new(),
            read_buf: BytesMut::with_capacity(4096),
            events: VecDeque::new(),
            reconnect_attempts: 0,
        })
    }

    /// Replace the configuration. Only allowed while disconnected; a
    /// pending reconnect uses the new settings.
    pub fn configure(&mut self, mut config: ClientConfig) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::InvalidConfig(format!(
                "cannot reconfigure while {}",
                self.state
            )));
        }
        config.validate()?;
        config.ensure_client_id();
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Topic filters replayed on every successful connect.
    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.session.subscribed_topics()
    }

    /// Unacknowledged QoS 1 publishes by packet identifier.
    pub fn pending(&self) -> impl Iterator<Item = (u16, &PendingPublish)> {
        self.session.pending().iter().map(|(id, p)| (*id, p))
    }

    pub fn pending_count(&self) -> usize {
        self.session.pending().len()
    }

    /// Consecutive reconnect attempts since the last accepted CONNACK.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    /// Logical time at which the next timer fires.
    pub fn next_timer_deadline(&self) -> Option<Duration> {
        self.scheduler.next_deadline()
    }

    /// Next queued notification.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Start connecting. No-op while connected or already connecting.
    pub fn connect(&mut self) {
        if self.state.is_connected() || self.state.is_connecting() {
            debug!("Connect ignored while {}", self.state);
            return;
        }
        self.reconnect_attempts = 0;
        self.start_connect();
    }

    fn start_connect(&mut self) {
        self.scheduler.cancel(Timer::Reconnect);
        self.read_buf.clear();
        self.set_state(ConnectionState::Connecting);
        self.scheduler
            .arm(Timer::ConnectTimeout, self.config.connect_timeout);

        info!(
            "Connecting to {} as {}",
            self.config.addr(),
            self.config.client_id
        );
        self.transport.open(&self.config.host, self.config.port);
    }

    /// Close the session. Stops all timers, cancels any pending reconnect,
    /// discards buffered input and drops unacknowledged publishes.
    pub fn disconnect(&mut self) {
        let was = self.state;
        if self.scheduler.is_armed(Timer::Reconnect) {
            debug!("Cancelling pending reconnect");
        }
        self.scheduler.cancel_all();
        self.reconnect_attempts = 0;

        if was.is_connected() {
            self.transport.write(v4::disconnect());
        }
        if was != ConnectionState::Disconnected {
            self.transport.close();
        }

        self.read_buf.clear();
        let dropped = self.session.clear_pending();
        if dropped > 0 {
            debug!("Dropped {} unacknowledged publishes", dropped);
        }

        self.set_state(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            info!("Disconnected from {}", self.config.addr());
            self.events.push_back(Event::Disconnected);
        }
    }

    /// Publish a message. Returns the packet identifier for QoS 1.
    ///
    /// Nothing is queued while disconnected.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        self.publish_message(Message::new(topic, payload).with_qos(qos).with_retain(retain))
    }

    pub fn publish_message(&mut self, message: Message) -> Result<Option<u16>> {
        if !self.state.is_connected() {
            warn!("Cannot publish to {}: not connected", message.topic);
            return Err(Error::NotConnected);
        }
        validate_topic_name(&message.topic)?;
        if message.qos == QoS::ExactlyOnce {
            return Err(Error::UnsupportedQoS(message.qos));
        }

        let pkid = match message.qos {
            QoS::AtMostOnce => None,
            _ => Some(self.session.next_packet_id()?),
        };

        let packet = Publish {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            retain: message.retain,
            dup: false,
            pkid: pkid.unwrap_or(0),
        }
        .encode()?;

        trace!(
            "Publishing to {} ({} bytes, pkid={:?})",
            message.topic,
            message.payload.len(),
            pkid
        );
        if let Some(id) = pkid {
            self.session.insert_pending(id, message, self.scheduler.now());
        }
        self.transport.write(packet);

        Ok(pkid)
    }

    /// Subscribe to topic filters. Filters are remembered and replayed on
    /// reconnect whatever the broker answers.
    pub fn subscribe<S: AsRef<str>>(&mut self, filters: &[S], qos: QoS) -> Result<()> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }
        if qos == QoS::ExactlyOnce {
            return Err(Error::UnsupportedQoS(qos));
        }
        for filter in filters {
            validate_topic_filter(filter.as_ref())?;
        }
        if filters.is_empty() {
            return Ok(());
        }

        let filters: Vec<(String, QoS)> = filters
            .iter()
            .map(|f| (f.as_ref().to_string(), qos))
            .collect();
        for (filter, qos) in &filters {
            self.session.add_subscription(filter, *qos);
        }
        self.send_subscribe(filters)
    }

    /// Unsubscribe from topic filters and forget them.
    pub fn unsubscribe<S: AsRef<str>>(&mut self, filters: &[S]) -> Result<()> {
        if !self.state.is_connected() {
            return Err(Error::NotConnected);
        }
        for filter in filters {
            validate_topic_filter(filter.as_ref())?;
        }
        if filters.is_empty() {
            return Ok(());
        }

        let topics: Vec<String> = filters.iter().map(|f| f.as_ref().to_string()).collect();
        for topic in &topics {
            self.session.remove_subscription(topic);
        }

        let pkid = self.session.next_packet_id()?;
        debug!("Unsubscribing from {:?} with pkid={}", topics, pkid);
        let packet = Unsubscribe { pkid, topics }.encode()?;
        self.transport.write(packet);
        Ok(())
    }

    fn send_subscribe(&mut self, filters: Vec<(String, QoS)>) -> Result<()> {
        let pkid = self.session.next_packet_id()?;
        debug!("Subscribing to {:?} with pkid={}", filters, pkid);
        let packet = Subscribe { pkid, filters }.encode()?;
        self.transport.write(packet);
        Ok(())
    }

    /// Feed one transport notification.
    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    debug!("Ignoring transport open while {}", self.state);
                    return;
                }
                self.send_connect();
            }
            TransportEvent::Data(bytes) => {
                if !self.is_active() {
                    trace!("Dropping {} bytes while {}", bytes.len(), self.state);
                    return;
                }
                self.read_buf.extend_from_slice(&bytes);
                self.process_incoming();
            }
            TransportEvent::Closed => {
                if !self.is_active() {
                    return;
                }
                info!("Connection to {} closed", self.config.addr());
                self.connection_lost();
            }
            TransportEvent::Error(reason) => {
                warn!("Transport error: {}", reason);
                self.events
                    .push_back(Event::Error(Error::Transport(reason)));
                if self.is_active() {
                    self.transport.abort();
                    self.connection_lost();
                }
            }
        }
    }

    /// Move logical time forward by `elapsed`, firing due timers.
    pub fn advance(&mut self, elapsed: Duration) {
        let target = self.scheduler.now() + elapsed;
        self.advance_to(target);
    }

    /// Move logical time forward to `target`, firing due timers in order.
    pub fn advance_to(&mut self, target: Duration) {
        while let Some(timer) = self.scheduler.pop_due(target) {
            self.on_timer(timer);
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("State {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(Event::StateChanged(state));
    }

    fn send_connect(&mut self) {
        let connect = Connect {
            client_id: self.config.client_id.clone(),
            keep_alive: self.config.keep_alive,
            clean_session: self.config.clean_session,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            will: self.config.will.as_ref().map(|w| Will {
                topic: w.topic.clone(),
                payload: w.payload.clone(),
                qos: w.qos,
                retain: w.retain,
            }),
        };

        match connect.encode() {
            Ok(packet) => {
                debug!("Sending CONNECT (keep_alive={}s)", self.config.keep_alive);
                self.transport.write(packet);
            }
            Err(e) => {
                warn!("Failed to encode CONNECT: {}", e);
                self.events.push_back(Event::Error(e));
                self.transport.abort();
                self.connection_lost();
            }
        }
    }

    fn process_incoming(&mut self) {
        while let Some((header, body)) = take_frame(&mut self.read_buf) {
            match Incoming::read(&header, &body) {
                Ok(packet) => self.handle_packet(packet),
                Err(e) => warn!(
                    "Dropping packet type {} ({} bytes): {}",
                    header.packet_type,
                    body.len(),
                    e
                ),
            }

            // A refused CONNACK tears the connection down mid-buffer.
            if !self.is_active() {
                self.read_buf.clear();
                break;
            }
        }
    }

    fn handle_packet(&mut self, packet: Incoming) {
        match packet {
            Incoming::ConnAck(connack) => {
                if self.state != ConnectionState::Connecting {
                    warn!("Unexpected CONNACK while {}", self.state);
                    return;
                }
                if connack.code == ConnectReturnCode::Accepted {
                    info!(
                        "Connected to {}, session_present={}",
                        self.config.addr(),
                        connack.session_present
                    );
                    self.on_connected();
                } else {
                    warn!(
                        "Connection refused (code {}): {}",
                        connack.code.to_u8(),
                        connack.code.reason()
                    );
                    self.events
                        .push_back(Event::Error(Error::ConnectionRefused(connack.code)));
                    self.transport.abort();
                    self.connection_lost();
                }
            }
            Incoming::Publish(publish) => {
                trace!("Received message on {}", publish.topic);
                match publish.qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => self.transport.write(v4::puback(publish.pkid)),
                    QoS::ExactlyOnce => {
                        warn!(
                            "Received QoS 2 publish on {} (pkid={}), not acknowledging",
                            publish.topic, publish.pkid
                        );
                    }
                }
                self.events.push_back(Event::MessageReceived(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                }));
            }
            Incoming::PubAck(pkid) => {
                if self.session.ack_pending(pkid).is_none() {
                    debug!("PubAck for unknown pkid={}", pkid);
                }
                self.events.push_back(Event::Published(pkid));
            }
            Incoming::SubAck(suback) => {
                debug!(
                    "Received SubAck for pkid={}: {:?}",
                    suback.pkid, suback.return_codes
                );
                for (index, code) in suback.return_codes.iter().enumerate() {
                    if *code == SubscribeReturnCode::Failure {
                        warn!(
                            "Subscription {} of pkid={} rejected by broker",
                            index, suback.pkid
                        );
                    }
                }
            }
            Incoming::UnsubAck(pkid) => debug!("Received UnsubAck for pkid={}", pkid),
            Incoming::PingResp => trace!("Received PingResp"),
            Incoming::Unknown(packet_type) => {
                warn!("Ignoring packet of unknown type {}", packet_type);
            }
        }
    }

    fn on_connected(&mut self) {
        self.scheduler.cancel(Timer::ConnectTimeout);
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Connected);

        if let Some(interval) = self.config.ping_interval() {
            self.scheduler.arm(Timer::KeepAlive, interval);
        }
        if let Some(timeout) = self.config.resend_timeout {
            self.scheduler.arm(Timer::Resend, timeout);
        }

        self.events.push_back(Event::Connected);
        self.resubscribe();
    }

    /// The broker's session is not trusted: every tracked filter is sent again.
    fn resubscribe(&mut self) {
        let filters: Vec<(String, QoS)> = self
            .session
            .subscriptions()
            .map(|(filter, qos)| (filter.to_string(), qos))
            .collect();

        for (filter, qos) in filters {
            if let Err(e) = self.send_subscribe(vec![(filter.clone(), qos)]) {
                warn!("Failed to resubscribe to {}: {}", filter, e);
                self.events.push_back(Event::Error(e));
            }
        }
    }

    fn connection_lost(&mut self) {
        let was = self.state;
        self.scheduler.cancel(Timer::ConnectTimeout);
        self.scheduler.cancel(Timer::KeepAlive);
        self.scheduler.cancel(Timer::Resend);
        self.read_buf.clear();

        self.set_state(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            self.events.push_back(Event::Disconnected);
        }

        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.config.auto_reconnect {
            return;
        }
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                warn!("Giving up after {} reconnect attempts", self.reconnect_attempts);
                self.events
                    .push_back(Event::Error(Error::ReconnectExhausted(self.reconnect_attempts)));
                return;
            }
        }

        debug!(
            "Reconnecting in {:?} (attempt {})",
            self.config.reconnect_interval,
            self.reconnect_attempts + 1
        );
        self.scheduler
            .arm(Timer::Reconnect, self.config.reconnect_interval);
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ConnectTimeout => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                warn!(
                    "No CONNACK from {} within {:?}",
                    self.config.addr(),
                    self.config.connect_timeout
                );
                self.events.push_back(Event::Error(Error::ConnectTimeout));
                self.transport.abort();
                self.connection_lost();
            }
            Timer::KeepAlive => {
                if !self.state.is_connected() {
                    return;
                }
                trace!("Sending PingReq");
                self.transport.write(v4::pingreq());
                if let Some(interval) = self.config.ping_interval() {
                    self.scheduler.arm(Timer::KeepAlive, interval);
                }
            }
            Timer::Reconnect => {
                if self.state != ConnectionState::Disconnected {
                    return;
                }
                self.reconnect_attempts += 1;
                info!("Reconnect attempt {}", self.reconnect_attempts);
                self.set_state(ConnectionState::Reconnecting);
                self.start_connect();
            }
            Timer::Resend => {
                if !self.state.is_connected() {
                    return;
                }
                if let Some(timeout) = self.config.resend_timeout {
                    self.resend_stale(timeout);
                    self.scheduler.arm(Timer::Resend, timeout);
                }
            }
        }
    }

    fn resend_stale(&mut self, timeout: Duration) {
        let now = self.scheduler.now();
        for pkid in self.session.pending_older_than(now, timeout) {
            let Some(entry) = self.session.mark_resent(pkid, now) else {
                continue;
            };
            let resends = entry.resends;
            let publish = Publish {
                topic: entry.message.topic.clone(),
                payload: entry.message.payload.clone(),
                qos: entry.message.qos,
                retain: entry.message.retain,
                dup: true,
                pkid,
            };

            match publish.encode() {
                Ok(packet) => {
                    debug!("Resending pkid={} (resend {})", pkid, resends);
                    self.transport.write(packet);
                }
                Err(e) => warn!("Failed to re-encode pkid={}: {}", pkid, e),
            }
        }
    }
}
