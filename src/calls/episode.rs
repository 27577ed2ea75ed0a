//! Episode records.
//!
//! The episode is the business record telephony signaling races against:
//! a call can ring in before the episode row exists. Lookup goes through a
//! store trait so admission can poll with a bounded wait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub lobby_room: String,
    pub onair_room: String,
    pub live: bool,
    pub started_at: DateTime<Utc>,
}

impl Episode {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            lobby_room: format!("lobby-{}", id),
            onair_room: format!("onair-{}", id),
            id,
            live: true,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EpisodeStore: Send + Sync {
    /// The episode currently accepting callers, if any.
    async fn current(&self) -> Option<Episode>;

    async fn get(&self, id: &str) -> Option<Episode>;
}

/// In-memory episode store; the persistence collaborator replaces this at
/// the interface boundary.
pub struct InMemoryEpisodeStore {
    current: RwLock<Option<Episode>>,
}

impl InMemoryEpisodeStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    pub async fn set_current(&self, episode: Option<Episode>) {
        *self.current.write().await = episode;
    }
}

impl Default for InMemoryEpisodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EpisodeStore for InMemoryEpisodeStore {
    async fn current(&self) -> Option<Episode> {
        self.current.read().await.clone().filter(|e| e.live)
    }

    async fn get(&self, id: &str) -> Option<Episode> {
        self.current
            .read()
            .await
            .clone()
            .filter(|e| e.id == id)
    }
}
