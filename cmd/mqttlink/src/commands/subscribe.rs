//! `mqttlink sub`.

use anyhow::Result;
use clap::Args;
use mqttlink::Event;
use tracing::{info, warn};

use super::{client_config, connect, parse_qos};
use crate::Cli;

/// Subscribe to topic filters and print what arrives.
#[derive(Args)]
pub struct SubCommand {
    /// Topic filter (repeatable)
    #[arg(short = 't', long = "topic", required = true)]
    topics: Vec<String>,

    /// QoS level (0 or 1)
    #[arg(short = 'q', long, default_value_t = 0)]
    qos: u8,

    /// Exit after this many messages
    #[arg(short = 'C', long)]
    count: Option<usize>,
}

impl SubCommand {
    pub async fn run(&self, cli: &Cli) -> Result<()> {
        let qos = parse_qos(self.qos)?;
        let config = client_config(cli)?;
        let (client, mut events) = connect(config).await?;

        client.subscribe(self.topics.as_slice(), qos).await?;
        info!("Subscribed to {:?}", self.topics);

        let mut received = 0usize;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        Event::MessageReceived(msg) => {
                            println!("{} {}", msg.topic, String::from_utf8_lossy(&msg.payload));
                            received += 1;
                            if self.count.is_some_and(|n| received >= n) {
                                break;
                            }
                        }
                        Event::Connected => info!("Reconnected, subscriptions replayed"),
                        Event::Disconnected => warn!("Connection lost"),
                        Event::Error(e) => warn!("{}", e),
                        _ => {}
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        client.disconnect().await?;
        client.shutdown()?;
        Ok(())
    }
}
