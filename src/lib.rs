pub mod audio;
pub mod bridge;
pub mod calls;
pub mod config;
pub mod fabric;
pub mod http;
pub mod notify;
pub mod rooms;
pub mod telephony;

pub use audio::{
    AssetPlayer, AudioFrame, AudioGraphError, MixerConfig, MixerGraph, SourceId, SourceKind,
};
pub use bridge::{BridgeConfig, BridgeEvent, BridgeSession, MediaMessage};
pub use calls::{
    CallDirector, CallerState, DirectorConfig, Episode, EpisodeStore, InMemoryEpisodeStore,
    LifecycleError, Participant, Reconciler, ReconcilerConfig,
};
pub use config::Config;
pub use fabric::{ConferencingFabric, LocalFabric, MembershipEvent};
pub use http::{create_router, AppState};
pub use notify::{ChannelNotifier, NatsNotifier, Notifier, NullNotifier, StudioEvent};
pub use rooms::{RoomClass, RoomManager, RoomManagerConfig};
pub use telephony::CallInstruction;
