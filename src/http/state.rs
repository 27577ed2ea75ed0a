use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{AssetPlayer, MixerGraph};
use crate::calls::{CallDirector, InMemoryEpisodeStore};
use crate::fabric::ConferencingFabric;
use crate::rooms::RoomManager;

/// Fabric identity the host's master bus publishes under; the host's own
/// room subscription excludes it (mix-minus).
pub const HOST_IDENTITY: &str = "host";

/// Mixer source id of the on-air room subscription.
pub const ONAIR_SOURCE: &str = "onair-room";

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub director: Arc<CallDirector>,
    pub mixer: Arc<MixerGraph>,
    pub assets: Arc<AssetPlayer>,
    pub rooms: Arc<RoomManager>,
    pub fabric: Arc<dyn ConferencingFabric>,
    pub episodes: Arc<InMemoryEpisodeStore>,
    /// Shared secret telephony webhook signatures are verified with.
    pub webhook_secret: String,
    /// Provider call reference → participant id, bound on admission.
    pub call_index: Arc<RwLock<HashMap<String, Uuid>>>,
    /// Task forwarding the master bus into the live on-air room.
    pub relay_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        director: Arc<CallDirector>,
        mixer: Arc<MixerGraph>,
        assets: Arc<AssetPlayer>,
        rooms: Arc<RoomManager>,
        fabric: Arc<dyn ConferencingFabric>,
        episodes: Arc<InMemoryEpisodeStore>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            director,
            mixer,
            assets,
            rooms,
            fabric,
            episodes,
            webhook_secret: webhook_secret.into(),
            call_index: Arc::new(RwLock::new(HashMap::new())),
            relay_task: Arc::new(Mutex::new(None)),
        }
    }
}
