//! In-process conferencing fabric.
//!
//! Rooms are registries of publisher feeds; a fabric tick mixes each room
//! once per frame interval and fans the result out to subscribers, composing
//! a per-listener mix that excludes the listener's own identity.

use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::{ConferencingFabric, MembershipEvent, MixMinusSubscription, TrackPublisher};
use crate::audio::frame::{frame_interval, mix_slices, FABRIC_FRAME_SAMPLES};

/// Frames buffered per publisher before the oldest is dropped.
const PUBLISHER_QUEUE_DEPTH: usize = 4;
const CHANNEL_CAPACITY: usize = 8;

struct PublisherSlot {
    rx: mpsc::Receiver<Vec<i16>>,
    queue: VecDeque<Vec<i16>>,
}

struct SubscriberSlot {
    exclude: String,
    tx: mpsc::Sender<Vec<i16>>,
}

#[derive(Default)]
struct LocalRoom {
    publishers: HashMap<String, PublisherSlot>,
    subscribers: Vec<SubscriberSlot>,
}

pub struct LocalFabric {
    rooms: Mutex<HashMap<String, LocalRoom>>,
    events: broadcast::Sender<MembershipEvent>,
    running: AtomicBool,
}

impl LocalFabric {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            rooms: Mutex::new(HashMap::new()),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the mixing tick loop at the frame cadence.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let fabric = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Local fabric mixing loop started");
            while fabric.running.load(Ordering::SeqCst) {
                interval.tick().await;
                fabric.tick_once();
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one mixing pass over every room. Exposed so tests can drive the
    /// fabric deterministically without the wall clock.
    pub fn tick_once(&self) {
        let mut rooms = self.rooms.lock().unwrap();

        for room in rooms.values_mut() {
            // Pull at most one frame per publisher for this tick, keeping a
            // short bounded backlog per publisher.
            let mut current: HashMap<&str, Vec<i16>> = HashMap::new();
            for (identity, slot) in room.publishers.iter_mut() {
                while let Ok(frame) = slot.rx.try_recv() {
                    if slot.queue.len() >= PUBLISHER_QUEUE_DEPTH {
                        slot.queue.pop_front();
                    }
                    slot.queue.push_back(frame);
                }
                if let Some(frame) = slot.queue.pop_front() {
                    current.insert(identity.as_str(), frame);
                }
            }

            // Per-listener mix bus: sum everyone except the listener.
            room.subscribers.retain(|sub| {
                let inputs: Vec<&[i16]> = current
                    .iter()
                    .filter(|(identity, _)| sub.exclude != **identity)
                    .map(|(_, frame)| frame.as_slice())
                    .collect();

                let mixed = if inputs.is_empty() {
                    vec![0i16; FABRIC_FRAME_SAMPLES]
                } else {
                    mix_slices(&inputs, FABRIC_FRAME_SAMPLES)
                };

                match sub.tx.try_send(mixed) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true, // subscriber behind, drop frame
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    /// Test hook: sever every subscription in a room without removing the
    /// room, simulating transient room unreachability.
    pub fn drop_subscriptions(&self, room: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(room) = rooms.get_mut(room) {
            room.subscribers.clear();
        }
    }

    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.lock().unwrap().contains_key(room)
    }

    fn emit(&self, room: &str, identity: &str, joined: bool) {
        let _ = self.events.send(MembershipEvent {
            room: room.to_string(),
            identity: identity.to_string(),
            joined,
            at: Utc::now(),
        });
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConferencingFabric for LocalFabric {
    async fn ensure_room(&self, room: &str) -> Result<()> {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.entry(room.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, room: &str, identity: &str) -> Result<TrackPublisher> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let mut rooms = self.rooms.lock().unwrap();
            let Some(entry) = rooms.get_mut(room) else {
                bail!("room {} does not exist on the fabric", room);
            };
            entry.publishers.insert(
                identity.to_string(),
                PublisherSlot {
                    rx,
                    queue: VecDeque::new(),
                },
            );
        }

        debug!("Fabric publish: {} into {}", identity, room);
        self.emit(room, identity, true);
        Ok(TrackPublisher::new(room.to_string(), identity.to_string(), tx))
    }

    async fn unpublish(&self, room: &str, identity: &str) -> Result<()> {
        let removed = {
            let mut rooms = self.rooms.lock().unwrap();
            rooms
                .get_mut(room)
                .map(|r| r.publishers.remove(identity).is_some())
                .unwrap_or(false)
        };

        if removed {
            debug!("Fabric unpublish: {} from {}", identity, room);
            self.emit(room, identity, false);
        }
        Ok(())
    }

    async fn subscribe_mix_minus(&self, room: &str, exclude: &str) -> Result<MixMinusSubscription> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let mut rooms = self.rooms.lock().unwrap();
            let Some(entry) = rooms.get_mut(room) else {
                bail!("room {} does not exist on the fabric", room);
            };
            entry.subscribers.push(SubscriberSlot {
                exclude: exclude.to_string(),
                tx,
            });
        }

        debug!("Fabric subscribe: {} mix-minus {}", room, exclude);
        Ok(MixMinusSubscription::new(
            room.to_string(),
            exclude.to_string(),
            rx,
        ))
    }

    async fn members(&self, room: &str) -> Result<Vec<String>> {
        let rooms = self.rooms.lock().unwrap();
        match rooms.get(room) {
            Some(r) => Ok(r.publishers.keys().cloned().collect()),
            None => bail!("room {} does not exist on the fabric", room),
        }
    }

    async fn close_room(&self, room: &str) -> Result<()> {
        let removed = self.rooms.lock().unwrap().remove(room);
        if let Some(r) = removed {
            info!("Fabric room {} closed ({} publishers)", room, r.publishers.len());
            for identity in r.publishers.keys() {
                self.emit(room, identity, false);
            }
        }
        Ok(())
    }

    fn membership_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::SubscriptionPoll;

    #[tokio::test]
    async fn test_mix_minus_excludes_own_contribution() {
        let fabric = LocalFabric::new();
        fabric.ensure_room("r").await.unwrap();

        let alice = fabric.publish("r", "alice").await.unwrap();
        let bob = fabric.publish("r", "bob").await.unwrap();
        let mut sub = fabric.subscribe_mix_minus("r", "alice").await.unwrap();

        alice.publish(vec![1000i16; FABRIC_FRAME_SAMPLES]);
        bob.publish(vec![500i16; FABRIC_FRAME_SAMPLES]);
        fabric.tick_once();

        match sub.poll_frame() {
            SubscriptionPoll::Frame(frame) => {
                // Alice hears only Bob.
                assert!(frame.iter().all(|&s| s == 500));
            }
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn test_empty_room_mixes_silence() {
        let fabric = LocalFabric::new();
        fabric.ensure_room("r").await.unwrap();
        let mut sub = fabric.subscribe_mix_minus("r", "x").await.unwrap();

        fabric.tick_once();
        match sub.poll_frame() {
            SubscriptionPoll::Frame(frame) => assert!(frame.iter().all(|&s| s == 0)),
            _ => panic!("expected a silence frame"),
        }
    }

    #[tokio::test]
    async fn test_closed_room_loses_subscriptions() {
        let fabric = LocalFabric::new();
        fabric.ensure_room("r").await.unwrap();
        let mut sub = fabric.subscribe_mix_minus("r", "x").await.unwrap();

        fabric.close_room("r").await.unwrap();
        fabric.tick_once();

        // Drain whatever was in flight, then observe the loss.
        loop {
            match sub.poll_frame() {
                SubscriptionPoll::Frame(_) => continue,
                SubscriptionPoll::Lost => break,
                SubscriptionPoll::Empty => panic!("subscription should be lost"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_requires_room() {
        let fabric = LocalFabric::new();
        assert!(fabric.publish("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_membership_events_emitted() {
        let fabric = LocalFabric::new();
        let mut events = fabric.membership_events();

        fabric.ensure_room("r").await.unwrap();
        let _pub = fabric.publish("r", "alice").await.unwrap();
        fabric.unpublish("r", "alice").await.unwrap();

        let joined = events.recv().await.unwrap();
        assert!(joined.joined);
        assert_eq!(joined.identity, "alice");

        let left = events.recv().await.unwrap();
        assert!(!left.joined);
    }

    #[tokio::test]
    async fn test_publisher_backlog_bounded() {
        let fabric = LocalFabric::new();
        fabric.ensure_room("r").await.unwrap();
        let alice = fabric.publish("r", "alice").await.unwrap();

        for i in 0..CHANNEL_CAPACITY {
            alice.publish(vec![i as i16; FABRIC_FRAME_SAMPLES]);
        }
        fabric.tick_once();

        let members = fabric.members("r").await.unwrap();
        assert_eq!(members, vec!["alice".to_string()]);
    }
}
