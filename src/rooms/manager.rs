//! Conferencing room lifecycle and membership tracking.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::token::{self, RoomToken};
use crate::bridge::BridgeEvent;
use crate::fabric::ConferencingFabric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomClass {
    /// Holding room callers land in on admission.
    Lobby,
    /// Private per-caller room shared with one screener.
    Screening,
    /// The episode's live broadcast room.
    OnAir,
}

impl RoomClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomClass::Lobby => "lobby",
            RoomClass::Screening => "screening",
            RoomClass::OnAir => "on-air",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub class: RoomClass,
    pub members: HashSet<String>,
    pub destroy_on_empty: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoomManagerConfig {
    pub token_secret: String,
    pub token_ttl_secs: i64,
    /// Attempts for fabric-side room creation before giving up.
    pub create_attempts: u32,
    pub create_backoff: Duration,
}

impl Default for RoomManagerConfig {
    fn default() -> Self {
        Self {
            token_secret: "studio-room-secret".to_string(),
            token_ttl_secs: 300,
            create_attempts: 3,
            create_backoff: Duration::from_millis(100),
        }
    }
}

pub struct RoomManager {
    fabric: Arc<dyn ConferencingFabric>,
    rooms: RwLock<HashMap<String, Room>>,
    config: RoomManagerConfig,
}

impl RoomManager {
    pub fn new(fabric: Arc<dyn ConferencingFabric>, config: RoomManagerConfig) -> Self {
        Self {
            fabric,
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Idempotent create: returns the existing room when present, otherwise
    /// creates it on the fabric with bounded backoff. Concurrent first
    /// joiners race onto the same entry rather than duplicating the room.
    pub async fn create_room(&self, id: &str, class: RoomClass) -> Result<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(existing) = rooms.get(id) {
                return Ok(existing.clone());
            }
        }

        // Room existence is a prerequisite for admission, so creation
        // retries before surfacing.
        let mut backoff = self.config.create_backoff;
        let mut last_err = None;
        for attempt in 1..=self.config.create_attempts {
            match self.fabric.ensure_room(id).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "Fabric room create for {} failed (attempt {}/{}): {}",
                        id, attempt, self.config.create_attempts, e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e).with_context(|| format!("failed to create room {}", id));
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(id.to_string()).or_insert_with(|| {
            info!("Room created: {} ({})", id, class.as_str());
            Room {
                id: id.to_string(),
                class,
                members: HashSet::new(),
                destroy_on_empty: false,
                created_at: Utc::now(),
            }
        });
        Ok(room.clone())
    }

    /// Issue a short-lived join credential scoped to one room and identity.
    /// Failures surface synchronously to the caller.
    pub async fn issue_token(
        &self,
        room: &str,
        identity: &str,
        capabilities: &[String],
    ) -> Result<RoomToken> {
        let rooms = self.rooms.read().await;
        if !rooms.contains_key(room) {
            anyhow::bail!("cannot issue token for unknown room {}", room);
        }

        token::issue(
            &self.config.token_secret,
            room,
            identity,
            capabilities,
            self.config.token_ttl_secs,
        )
    }

    pub fn verify_token(&self, tok: &str) -> Result<token::TokenClaims> {
        token::verify(&self.config.token_secret, tok)
    }

    /// Destroy a room. Only proceeds when membership is empty; otherwise the
    /// destruction is deferred to the last leave.
    pub async fn destroy_room(&self, id: &str) -> Result<bool> {
        let empty = {
            let mut rooms = self.rooms.write().await;
            match rooms.get_mut(id) {
                None => return Ok(true),
                Some(room) if room.members.is_empty() => {
                    rooms.remove(id);
                    true
                }
                Some(room) => {
                    room.destroy_on_empty = true;
                    false
                }
            }
        };

        if empty {
            self.fabric.close_room(id).await?;
            info!("Room destroyed: {}", id);
        } else {
            debug!("Room {} still occupied, destroy deferred to last leave", id);
        }
        Ok(empty)
    }

    pub async fn room(&self, id: &str) -> Option<Room> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn members_of(&self, id: &str) -> HashSet<String> {
        self.rooms
            .read()
            .await
            .get(id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    pub async fn class_of(&self, id: &str) -> Option<RoomClass> {
        self.rooms.read().await.get(id).map(|r| r.class)
    }

    /// Apply one membership observation (from the fabric's event stream or
    /// a telephony conference webhook). Executes any deferred destroy once
    /// the last member leaves.
    pub async fn apply_membership(&self, room_id: &str, identity: &str, joined: bool) {
        let destroy = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(room_id) else {
                return;
            };

            if joined {
                room.members.insert(identity.to_string());
                false
            } else {
                room.members.remove(identity);
                room.members.is_empty() && room.destroy_on_empty
            }
        };

        if destroy {
            info!("Last member left {}, executing deferred destroy", room_id);
            {
                self.rooms.write().await.remove(room_id);
            }
            if let Err(e) = self.fabric.close_room(room_id).await {
                warn!("Deferred destroy of {} failed: {}", room_id, e);
            }
        }
    }

    /// Consume the fabric's membership stream. Spawned at startup; the
    /// stream is eventually consistent and drives deferred destroys.
    pub async fn run_membership_events(self: Arc<Self>) {
        let mut events = self.fabric.membership_events();
        info!("Room membership event loop started");

        loop {
            match events.recv().await {
                Ok(event) => {
                    self.apply_membership(&event.room, &event.identity, event.joined)
                        .await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Membership event stream lagged by {}, will reconcile", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("Room membership event loop stopped");
    }

    /// Consume the bridge lifecycle channel (the typed replacement for ad
    /// hoc cross-component notifications).
    pub async fn run_bridge_events(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::Receiver<BridgeEvent>,
    ) {
        info!("Bridge event loop started");
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::Attached { room, identity } => {
                    debug!("Bridge attached: {} -> {}", identity, room);
                }
                BridgeEvent::Detached { room, identity } => {
                    debug!("Bridge detached: {} from {}", identity, room);
                    self.apply_membership(&room, &identity, false).await;
                }
                BridgeEvent::SubscriptionLost { room, identity } => {
                    warn!(
                        "Bridge {} lost its subscription to {}, degraded to silence",
                        identity, room
                    );
                }
                BridgeEvent::Resubscribed { room, identity } => {
                    info!("Bridge {} recovered its subscription to {}", identity, room);
                }
            }
        }
        info!("Bridge event loop stopped");
    }
}
