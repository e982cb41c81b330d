//! CLI commands module.

mod publish;
mod subscribe;

pub use publish::PubCommand;
pub use subscribe::SubCommand;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use mqttlink::{AsyncClient, ClientConfig, Event};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::Cli;

/// Build the client config from the config file and global flags.
pub(crate) fn client_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("failed to load config {path}"))?,
        None => ClientConfig::default(),
    };

    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(id) = &cli.client_id {
        config.client_id = id.clone();
    }
    if let Some(username) = &cli.username {
        config.username = Some(username.clone());
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    if let Some(keep_alive) = cli.keep_alive {
        config.keep_alive = keep_alive;
    }

    config.validate()?;
    Ok(config)
}

/// Spawn a client and wait for the first accepted CONNACK.
///
/// Fails on the first error reported before the session is up, so a
/// wrong host or bad credentials surface immediately instead of retrying.
pub(crate) async fn connect(
    config: ClientConfig,
) -> Result<(AsyncClient, UnboundedReceiver<Event>)> {
    let wait = config.connect_timeout + Duration::from_secs(1);
    let addr = config.addr();
    let (client, mut events) = mqttlink::spawn(config)?;
    client.connect()?;

    let connected = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                Event::Connected => return Ok::<(), anyhow::Error>(()),
                Event::Error(e) => bail!("connect to {addr} failed: {e}"),
                _ => {}
            }
        }
        bail!("client stopped before connecting")
    })
    .await;

    match connected {
        Ok(result) => result?,
        Err(_) => bail!("timed out connecting to {addr}"),
    }

    info!("Connected to {}", addr);
    Ok((client, events))
}

pub(crate) fn parse_qos(value: u8) -> Result<mqttlink::QoS> {
    match mqttlink::QoS::from_u8(value) {
        Some(qos @ (mqttlink::QoS::AtMostOnce | mqttlink::QoS::AtLeastOnce)) => Ok(qos),
        _ => bail!("qos must be 0 or 1, got {value}"),
    }
}
