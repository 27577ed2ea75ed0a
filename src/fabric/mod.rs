//! Conferencing fabric boundary.
//!
//! The fabric is the wideband transport that rooms live on. The rest of the
//! system only sees this trait: publish a track into a room, subscribe to a
//! room's mix-minus feed, observe membership. `LocalFabric` is the in-process
//! implementation used by the bridge, the mixer's room subscriptions, and the
//! test suite.

pub mod local;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

pub use local::LocalFabric;

/// A membership change observed on the fabric. Eventually consistent: the
/// state machine never blocks on these to consider a transition complete.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub room: String,
    pub identity: String,
    pub joined: bool,
    pub at: DateTime<Utc>,
}

/// An outbound audio track into one room.
pub struct TrackPublisher {
    pub room: String,
    pub identity: String,
    tx: mpsc::Sender<Vec<i16>>,
}

impl TrackPublisher {
    pub fn new(room: String, identity: String, tx: mpsc::Sender<Vec<i16>>) -> Self {
        Self { room, identity, tx }
    }

    /// Push one frame toward the room. Never blocks; returns false when the
    /// fabric is behind or the room is gone (the caller degrades, it does
    /// not stall).
    pub fn publish(&self, samples: Vec<i16>) -> bool {
        self.tx.try_send(samples).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Result of a non-blocking poll on a mix-minus subscription.
pub enum SubscriptionPoll {
    Frame(Vec<i16>),
    Empty,
    /// The fabric side is gone; the subscriber must resubscribe.
    Lost,
}

/// An inbound feed of a room's mix, excluding one identity's own
/// contribution (mix-minus, so a caller never hears themselves echoed).
pub struct MixMinusSubscription {
    pub room: String,
    pub exclude: String,
    rx: mpsc::Receiver<Vec<i16>>,
}

impl MixMinusSubscription {
    pub fn new(room: String, exclude: String, rx: mpsc::Receiver<Vec<i16>>) -> Self {
        Self { room, exclude, rx }
    }

    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }

    pub fn poll_frame(&mut self) -> SubscriptionPoll {
        match self.rx.try_recv() {
            Ok(samples) => SubscriptionPoll::Frame(samples),
            Err(mpsc::error::TryRecvError::Empty) => SubscriptionPoll::Empty,
            Err(mpsc::error::TryRecvError::Disconnected) => SubscriptionPoll::Lost,
        }
    }
}

#[async_trait::async_trait]
pub trait ConferencingFabric: Send + Sync {
    /// Make sure a room exists on the fabric. Idempotent.
    async fn ensure_room(&self, room: &str) -> Result<()>;

    /// Publish an audio track into a room under an identity.
    async fn publish(&self, room: &str, identity: &str) -> Result<TrackPublisher>;

    /// Withdraw an identity's track from a room.
    async fn unpublish(&self, room: &str, identity: &str) -> Result<()>;

    /// Subscribe to a room's mix excluding one identity's contribution.
    async fn subscribe_mix_minus(&self, room: &str, exclude: &str) -> Result<MixMinusSubscription>;

    /// Current publishers in a room.
    async fn members(&self, room: &str) -> Result<Vec<String>>;

    /// Tear a room down; existing subscriptions observe the loss.
    async fn close_room(&self, room: &str) -> Result<()>;

    /// Membership change stream.
    fn membership_events(&self) -> broadcast::Receiver<MembershipEvent>;
}
