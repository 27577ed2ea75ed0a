use anyhow::{Context, Result};
use async_nats::Client;
use tracing::info;

use super::messages::StudioEvent;
use super::Notifier;

/// NATS-backed notifier, one subject family per episode.
pub struct NatsNotifier {
    client: Client,
}

impl NatsNotifier {
    /// Connect to the NATS server backing the notifier channel.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Notifier for NatsNotifier {
    async fn publish(&self, event: &StudioEvent) -> Result<()> {
        let subject = format!(
            "studio.episode.{}.{}",
            event.episode_id(),
            event.subject_suffix()
        );

        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(subject, payload.into())
            .await
            .context("Failed to publish studio event")?;

        Ok(())
    }
}
