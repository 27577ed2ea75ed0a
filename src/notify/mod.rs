//! Outbound state-change publication.
//!
//! The notifier is a fire-and-forget sink: transitions publish through it
//! without ever awaiting delivery for their own success.

pub mod client;
pub mod messages;

use anyhow::Result;
use tokio::sync::mpsc;

pub use client::NatsNotifier;
pub use messages::{ParticipantStateChanged, RoomMembershipChanged, StudioEvent};

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &StudioEvent) -> Result<()>;
}

/// Notifier that drops everything; used when no NATS server is configured.
pub struct NullNotifier;

#[async_trait::async_trait]
impl Notifier for NullNotifier {
    async fn publish(&self, _event: &StudioEvent) -> Result<()> {
        Ok(())
    }
}

/// Notifier delivering into an in-process channel; used by tests and
/// embedders that consume events directly.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<StudioEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StudioEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl Notifier for ChannelNotifier {
    async fn publish(&self, event: &StudioEvent) -> Result<()> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_channel_notifier_delivers() {
        let (notifier, mut rx) = ChannelNotifier::new();

        let event = StudioEvent::ParticipantStateChanged(ParticipantStateChanged {
            episode_id: "ep-1".into(),
            participant_id: Uuid::new_v4(),
            caller_ref: "+15551234".into(),
            state: "queued".into(),
            room: Some("lobby-ep-1".into()),
            muted: true,
            at: Utc::now(),
        });

        notifier.publish(&event).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.episode_id(), "ep-1");
        assert_eq!(received.subject_suffix(), "participant");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = StudioEvent::RoomMembershipChanged(RoomMembershipChanged {
            episode_id: "ep-1".into(),
            room: "onair-ep-1".into(),
            identity: "caller-1".into(),
            joined: true,
            at: Utc::now(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"room_membership_changed\""));
    }
}
