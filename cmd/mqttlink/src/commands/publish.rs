//! `mqttlink pub`.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Args;
use mqttlink::{Event, QoS};
use tracing::{debug, info};

use super::{client_config, connect, parse_qos};
use crate::Cli;

/// Publish one or more messages.
#[derive(Args)]
pub struct PubCommand {
    /// Topic to publish to
    #[arg(short = 't', long)]
    topic: String,

    /// Message payload
    #[arg(short = 'm', long, conflicts_with = "file")]
    message: Option<String>,

    /// Read the payload from a file
    #[arg(short = 'f', long)]
    file: Option<String>,

    /// QoS level (0 or 1)
    #[arg(short = 'q', long, default_value_t = 0)]
    qos: u8,

    /// Set the retain flag
    #[arg(short = 'r', long)]
    retain: bool,

    /// Number of times to publish
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Delay between publishes in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

impl PubCommand {
    pub async fn run(&self, cli: &Cli) -> Result<()> {
        let qos = parse_qos(self.qos)?;
        let payload = self.payload()?;
        let config = client_config(cli)?;
        let ack_wait = config.connect_timeout.max(Duration::from_secs(5));

        let (client, mut events) = connect(config).await?;

        for i in 0..self.count {
            let pkid = client
                .publish(&self.topic, payload.clone(), qos, self.retain)
                .await?;

            if qos == QoS::AtLeastOnce {
                let Some(pkid) = pkid else {
                    bail!("qos 1 publish without packet id");
                };
                wait_for_ack(&mut events, pkid, ack_wait).await?;
                debug!("Publish {} acknowledged (pkid={})", i + 1, pkid);
            }

            if self.interval_ms > 0 && i + 1 < self.count {
                tokio::time::sleep(Duration::from_millis(self.interval_ms)).await;
            }
        }

        info!(
            "Published {} message(s) to {} ({} bytes each)",
            self.count,
            self.topic,
            payload.len()
        );

        client.disconnect().await?;
        client.shutdown()?;
        Ok(())
    }

    fn payload(&self) -> Result<Bytes> {
        match (&self.message, &self.file) {
            (Some(message), _) => Ok(Bytes::from(message.clone())),
            (None, Some(path)) => {
                let data = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
                Ok(Bytes::from(data))
            }
            (None, None) => Ok(Bytes::new()),
        }
    }
}

async fn wait_for_ack(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    pkid: u16,
    wait: Duration,
) -> Result<()> {
    let acked = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                Event::Published(id) if id == pkid => return true,
                Event::Disconnected => return false,
                _ => {}
            }
        }
        false
    })
    .await;

    match acked {
        Ok(true) => Ok(()),
        Ok(false) => bail!("connection lost before PUBACK for pkid={pkid}"),
        Err(_) => bail!("no PUBACK for pkid={pkid} within {wait:?}"),
    }
}
