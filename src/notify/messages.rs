use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Participant lifecycle change, published for dashboards and screening UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantStateChanged {
    pub episode_id: String,
    pub participant_id: Uuid,
    pub caller_ref: String,
    pub state: String,
    pub room: Option<String>,
    pub muted: bool,
    pub at: DateTime<Utc>,
}

/// Room membership change observed by the room manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMembershipChanged {
    pub episode_id: String,
    pub room: String,
    pub identity: String,
    pub joined: bool,
    pub at: DateTime<Utc>,
}

/// Outbound event envelope, addressed by episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StudioEvent {
    ParticipantStateChanged(ParticipantStateChanged),
    RoomMembershipChanged(RoomMembershipChanged),
}

impl StudioEvent {
    pub fn episode_id(&self) -> &str {
        match self {
            StudioEvent::ParticipantStateChanged(e) => &e.episode_id,
            StudioEvent::RoomMembershipChanged(e) => &e.episode_id,
        }
    }

    pub fn subject_suffix(&self) -> &'static str {
        match self {
            StudioEvent::ParticipantStateChanged(_) => "participant",
            StudioEvent::RoomMembershipChanged(_) => "room",
        }
    }
}
