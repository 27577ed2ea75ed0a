pub mod jitter;
pub mod media;
pub mod session;

pub use jitter::JitterBuffer;
pub use media::{decode_pcm, encode_pcm, MediaMessage};
pub use session::{BridgeConfig, BridgeSession};

/// Lifecycle notifications from bridge sessions to the room manager,
/// carried on a bounded channel for backpressure.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Attached { room: String, identity: String },
    Detached { room: String, identity: String },
    SubscriptionLost { room: String, identity: String },
    Resubscribed { room: String, identity: String },
}

/// Capacity of the bridge-to-room-manager event channel.
pub const BRIDGE_EVENT_CAPACITY: usize = 64;
