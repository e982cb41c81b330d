//! Client configuration.
//!
//! Built in code with `ClientConfig::new(..).with_*(..)`, or loaded from
//! YAML. Durations in YAML are milliseconds:
//!
//! ```yaml
//! host: broker.local
//! port: 1883
//! client_id: station-7
//! keep_alive: 30
//! connect_timeout_ms: 5000
//! reconnect_interval_ms: 2000
//! will:
//!   topic: stations/7/status
//!   payload: offline
//!   qos: 1
//!   retain: true
//! ```

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::codec::MAX_STRING_LENGTH;
use crate::types::QoS;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Prefix of generated client identifiers.
pub const CLIENT_ID_PREFIX: &str = "mqttlink-";

/// Last Will and Testament published by the broker if the client vanishes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LastWill {
    pub topic: String,
    #[serde(default, deserialize_with = "bytes_from_str")]
    pub payload: Bytes,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID. Empty means "generate one".
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication. Requires a username.
    pub password: Option<String>,
    /// Keep alive interval in seconds. PINGREQ is sent every `keep_alive / 2`.
    /// Zero disables keep-alive.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Time allowed from connect request to CONNACK.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    /// Delay before each reconnect attempt.
    #[serde(rename = "reconnect_interval_ms", deserialize_with = "millis")]
    pub reconnect_interval: Duration,
    /// Reconnect after connection loss, refusal or timeout.
    pub auto_reconnect: bool,
    /// Give up after this many consecutive failed attempts.
    /// `None` keeps retrying forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Retransmit QoS 1 publishes left unacknowledged for this long.
    /// `None` never retransmits.
    #[serde(rename = "resend_timeout_ms", deserialize_with = "opt_millis")]
    pub resend_timeout: Option<Duration>,
    /// Last will.
    pub will: Option<LastWill>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl ClientConfig {
    /// Create a new client config with defaults: keep-alive 60s, clean
    /// session, 5s connect timeout, 5s reconnect interval, unbounded
    /// auto-reconnect, no retransmission.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            auto_reconnect: true,
            max_reconnect_attempts: None,
            resend_timeout: None,
            will: None,
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Set the client ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set username only.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_resend_timeout(mut self, timeout: Duration) -> Self {
        self.resend_timeout = Some(timeout);
        self
    }

    pub fn with_will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    /// `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Half the keep-alive interval, or `None` when keep-alive is disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        if self.keep_alive == 0 {
            return None;
        }
        Some(Duration::from_millis(self.keep_alive as u64 * 1000 / 2))
    }

    /// Fill in a generated client ID if none was given.
    pub fn ensure_client_id(&mut self) {
        if self.client_id.is_empty() {
            self.client_id = generate_client_id();
        }
    }

    /// Check the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host is empty".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect timeout must be positive".to_string()));
        }
        if self.reconnect_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "reconnect interval must be positive".to_string(),
            ));
        }
        if matches!(self.resend_timeout, Some(t) if t.is_zero()) {
            return Err(Error::InvalidConfig("resend timeout must be positive".to_string()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::InvalidConfig("password requires a username".to_string()));
        }

        for field in [
            Some(self.client_id.as_str()),
            self.username.as_deref(),
            self.password.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if field.len() > MAX_STRING_LENGTH {
                return Err(Error::StringTooLong(field.len()));
            }
        }

        if let Some(ref will) = self.will {
            validate_topic_name(&will.topic)?;
            if will.payload.len() > MAX_STRING_LENGTH {
                return Err(Error::StringTooLong(will.payload.len()));
            }
        }

        Ok(())
    }
}

/// Topic names (publish side) must be non-empty, fit the length prefix and
/// carry no wildcards.
pub(crate) fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(topic.to_string()));
    }
    if topic.len() > MAX_STRING_LENGTH {
        return Err(Error::StringTooLong(topic.len()));
    }
    Ok(())
}

/// Topic filters (subscribe side) must be non-empty and fit the length prefix.
pub(crate) fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopic(filter.to_string()));
    }
    if filter.len() > MAX_STRING_LENGTH {
        return Err(Error::StringTooLong(filter.len()));
    }
    Ok(())
}

/// `mqttlink-` followed by 8 random hex digits.
pub fn generate_client_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{CLIENT_ID_PREFIX}{}", &id[..8])
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn opt_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

fn bytes_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Bytes, D::Error> {
    String::deserialize(deserializer).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("broker", 1884)
            .with_client_id("dev1")
            .with_credentials("user", "pass")
            .with_keep_alive(30)
            .with_clean_session(false)
            .with_max_reconnect_attempts(3)
            .with_will(LastWill::new("w/t", "bye").with_qos(QoS::AtLeastOnce));

        assert_eq!(config.addr(), "broker:1884");
        assert_eq!(config.client_id, "dev1");
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some("pass"));
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(15)));
        assert!(!config.clean_session);
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, 60);
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.reconnect_interval, Duration::from_millis(5000));
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.resend_timeout, None);
    }

    #[test]
    fn test_generated_client_id() {
        let mut config = ClientConfig::new("h", 1883);
        config.ensure_client_id();
        assert!(config.client_id.starts_with(CLIENT_ID_PREFIX));
        assert_eq!(config.client_id.len(), CLIENT_ID_PREFIX.len() + 8);

        let kept = config.client_id.clone();
        config.ensure_client_id();
        assert_eq!(config.client_id, kept);
    }

    #[test]
    fn test_keep_alive_zero_disables_ping() {
        let config = ClientConfig::new("h", 1883).with_keep_alive(0);
        assert_eq!(config.ping_interval(), None);
    }

    #[test]
    fn test_validate_rejects() {
        let base = ClientConfig::new("h", 1883);

        let mut config = base.clone();
        config.password = Some("p".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = base.clone().with_reconnect_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = base.clone().with_resend_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = base.clone().with_will(LastWill::new("a/+", "x"));
        assert!(matches!(config.validate(), Err(Error::InvalidTopic(_))));

        let config = ClientConfig::new("", 1883);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
host: broker.local
port: 8883
client_id: station-7
username: op
password: secret
keep_alive: 30
connect_timeout_ms: 2500
reconnect_interval_ms: 1000
max_reconnect_attempts: 10
resend_timeout_ms: 20000
will:
  topic: stations/7/status
  payload: offline
  qos: 1
  retain: true
"#;
        let config = ClientConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "station-7");
        assert_eq!(config.keep_alive, 30);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.reconnect_interval, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_attempts, Some(10));
        assert_eq!(config.resend_timeout, Some(Duration::from_secs(20)));
        assert!(config.clean_session);

        let will = config.will.unwrap();
        assert_eq!(will.topic, "stations/7/status");
        assert_eq!(will.payload.as_ref(), b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_from_yaml_partial_uses_defaults() {
        let config = ClientConfig::from_yaml("host: test\n").unwrap();
        assert_eq!(config.host, "test");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.client_id.is_empty());
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_from_yaml_rejects_bad_qos() {
        let yaml = "will:\n  topic: t\n  qos: 3\n";
        assert!(matches!(
            ClientConfig::from_yaml(yaml),
            Err(Error::ConfigParse(_))
        ));
    }
}
