//! The live adapter pairing one phone call leg to one conferencing room.
//!
//! Inbound: narrowband frames from the media channel are upsampled and
//! published as the caller's track into the assigned room. Outbound: the
//! room's mix-minus feed is downsampled and paced to the phone's 20 ms
//! cadence through a bounded jitter buffer.
//!
//! The phone call is the scarce resource: a room-side fault degrades the
//! outbound path to silence and retries on backoff, it never hangs up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::jitter::JitterBuffer;
use super::media::{encode_pcm, MediaMessage};
use super::BridgeEvent;
use crate::audio::frame::{
    frame_interval, FABRIC_SAMPLE_RATE, TELEPHONY_FRAME_SAMPLES, TELEPHONY_SAMPLE_RATE,
};
use crate::audio::resample::{fabric_to_telephony, telephony_to_fabric};
use crate::fabric::{ConferencingFabric, MixMinusSubscription, SubscriptionPoll, TrackPublisher};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Frame ticks before the first resubscription attempt.
    pub initial_retry_ticks: u32,
    /// Backoff ceiling, in frame ticks.
    pub max_retry_ticks: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_retry_ticks: 5,
            max_retry_ticks: 50,
        }
    }
}

pub struct BridgeSession {
    participant_id: Uuid,
    identity: String,
    fabric: Arc<dyn ConferencingFabric>,
    config: BridgeConfig,
    room: Mutex<String>,
    publisher: Mutex<Option<TrackPublisher>>,
    subscription: Mutex<Option<MixMinusSubscription>>,
    jitter: Mutex<JitterBuffer>,
    muted: AtomicBool,
    running: AtomicBool,
    degraded: AtomicBool,
    phone_tx: Mutex<Option<mpsc::Sender<MediaMessage>>>,
    events: mpsc::Sender<BridgeEvent>,
    outbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeSession {
    /// Open a bridge into `room` and start its outbound pacing loop.
    ///
    /// A fabric-side attach failure does not fail the call: the session
    /// starts degraded and keeps retrying on backoff.
    pub async fn connect(
        participant_id: Uuid,
        identity: impl Into<String>,
        fabric: Arc<dyn ConferencingFabric>,
        room: &str,
        events: mpsc::Sender<BridgeEvent>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let identity = identity.into();
        let session = Arc::new(Self {
            participant_id,
            identity,
            fabric,
            config,
            room: Mutex::new(room.to_string()),
            publisher: Mutex::new(None),
            subscription: Mutex::new(None),
            jitter: Mutex::new(JitterBuffer::new(TELEPHONY_FRAME_SAMPLES)),
            muted: AtomicBool::new(true),
            running: AtomicBool::new(true),
            degraded: AtomicBool::new(true),
            phone_tx: Mutex::new(None),
            events,
            outbound_task: Mutex::new(None),
        });

        if let Err(e) = session.attach_room(room).await {
            warn!(
                "Bridge {} could not attach to {} yet: {} (starting degraded)",
                session.identity, room, e
            );
        }

        session.spawn_outbound();
        info!("Bridge session opened: {} -> {}", session.identity, room);
        session
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn current_room(&self) -> String {
        self.room.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Mute or unmute the bridged leg. Mutation is on the leg only; the
    /// phone media stream and room membership are untouched.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Bind the phone-side socket sender once the media channel connects.
    pub fn attach_phone(&self, tx: mpsc::Sender<MediaMessage>) {
        *self.phone_tx.lock().unwrap() = Some(tx);
        debug!("Bridge {} media channel attached", self.identity);
    }

    pub fn phone_connected(&self) -> bool {
        self.phone_tx.lock().unwrap().is_some()
    }

    /// Inbound path: one narrowband frame from the phone into the room.
    ///
    /// Muted legs publish silence so the track keeps its cadence. Uses
    /// `try_send` semantics throughout; a congested fabric drops frames
    /// rather than blocking the media channel.
    pub fn feed_inbound(&self, samples: &[i16]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let wide = if self.muted.load(Ordering::SeqCst) {
            let ratio = (FABRIC_SAMPLE_RATE / TELEPHONY_SAMPLE_RATE) as usize;
            vec![0i16; samples.len() * ratio]
        } else {
            telephony_to_fabric(samples)
        };

        let publisher = self.publisher.lock().unwrap();
        if let Some(publisher) = publisher.as_ref() {
            if !publisher.publish(wide) {
                debug!("Bridge {} inbound frame dropped (fabric behind)", self.identity);
            }
        }
    }

    /// Move the bridge to another room without dropping outbound audio:
    /// the jitter buffer keeps feeding the phone while the new attachment
    /// is established, then the old track is withdrawn.
    pub async fn reassign(&self, new_room: &str) -> anyhow::Result<()> {
        let old_room = self.current_room();
        if old_room == new_room {
            return Ok(());
        }

        self.attach_room(new_room).await?;
        *self.room.lock().unwrap() = new_room.to_string();
        self.degraded.store(false, Ordering::SeqCst);

        let _ = self.events.try_send(BridgeEvent::Attached {
            room: new_room.to_string(),
            identity: self.identity.clone(),
        });

        if let Err(e) = self.fabric.unpublish(&old_room, &self.identity).await {
            warn!("Bridge {} unpublish from {} failed: {}", self.identity, old_room, e);
        }
        let _ = self.events.try_send(BridgeEvent::Detached {
            room: old_room.clone(),
            identity: self.identity.clone(),
        });

        info!("Bridge {} reassigned {} -> {}", self.identity, old_room, new_room);
        Ok(())
    }

    /// Stop loops and withdraw from the room. Idempotent; ordering matters:
    /// loops first, then room leave — the caller then detaches any mixer
    /// sources and marks the participant terminal.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.outbound_task.lock().unwrap().take() {
            task.abort();
        }

        *self.phone_tx.lock().unwrap() = None;
        *self.subscription.lock().unwrap() = None;
        *self.publisher.lock().unwrap() = None;

        let room = self.current_room();
        if let Err(e) = self.fabric.unpublish(&room, &self.identity).await {
            debug!("Bridge {} unpublish on shutdown: {}", self.identity, e);
        }
        let _ = self.events.try_send(BridgeEvent::Detached {
            room,
            identity: self.identity.clone(),
        });

        info!("Bridge session closed: {}", self.identity);
    }

    async fn attach_room(&self, room: &str) -> anyhow::Result<()> {
        let publisher = self.fabric.publish(room, &self.identity).await?;
        let subscription = self
            .fabric
            .subscribe_mix_minus(room, &self.identity)
            .await?;

        *self.publisher.lock().unwrap() = Some(publisher);
        *self.subscription.lock().unwrap() = Some(subscription);
        self.degraded.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_outbound(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            session.run_outbound().await;
        });
        *self.outbound_task.lock().unwrap() = Some(task);
    }

    /// Outbound pacing loop: room mix → downsample → jitter buffer → phone,
    /// one frame per tick, silence when the room is silent or unreachable.
    async fn run_outbound(self: Arc<Self>) {
        let mut interval = tokio::time::interval(frame_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut retry_backoff = self.config.initial_retry_ticks;
        let mut retry_in: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            // Drain whatever the subscription has ready; detect loss.
            let mut lost = false;
            {
                let mut guard = self.subscription.lock().unwrap();
                if let Some(sub) = guard.as_mut() {
                    loop {
                        match sub.poll_frame() {
                            SubscriptionPoll::Frame(wide) => {
                                let narrow = fabric_to_telephony(&wide);
                                self.jitter.lock().unwrap().push(narrow);
                            }
                            SubscriptionPoll::Empty => break,
                            SubscriptionPoll::Lost => {
                                lost = true;
                                break;
                            }
                        }
                    }
                }
                if lost {
                    *guard = None;
                }
            }

            if lost && !self.degraded.swap(true, Ordering::SeqCst) {
                let room = self.current_room();
                warn!("Bridge {} lost room {}, substituting silence", self.identity, room);
                let _ = self.events.try_send(BridgeEvent::SubscriptionLost {
                    room,
                    identity: self.identity.clone(),
                });
                retry_backoff = self.config.initial_retry_ticks;
                retry_in = retry_backoff;
            }

            // Paced frame out, silence-substituted on underrun.
            let frame = self.jitter.lock().unwrap().pop();
            self.send_to_phone(MediaMessage::Media {
                payload: encode_pcm(&frame),
            });

            // Resubscription on backoff while degraded.
            if self.degraded.load(Ordering::SeqCst) {
                if retry_in == 0 {
                    let room = self.current_room();
                    match self.try_reattach(&room).await {
                        Ok(()) => {
                            info!("Bridge {} resubscribed to {}", self.identity, room);
                            let _ = self.events.try_send(BridgeEvent::Resubscribed {
                                room,
                                identity: self.identity.clone(),
                            });
                            retry_backoff = self.config.initial_retry_ticks;
                        }
                        Err(e) => {
                            debug!("Bridge {} resubscribe to {} failed: {}", self.identity, room, e);
                            retry_backoff = (retry_backoff * 2).min(self.config.max_retry_ticks);
                            retry_in = retry_backoff;
                        }
                    }
                } else {
                    retry_in -= 1;
                }
            }
        }
    }

    /// Repair hook for the reconciliation sweep: re-establish the fabric
    /// attachment for the current room if either direction is down.
    pub async fn ensure_attached(&self) -> anyhow::Result<()> {
        let healthy = !self.degraded.load(Ordering::SeqCst)
            && self
                .publisher
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.is_connected())
                .unwrap_or(false)
            && self.subscription.lock().unwrap().is_some();

        if healthy {
            return Ok(());
        }

        let room = self.current_room();
        self.try_reattach(&room).await
    }

    async fn try_reattach(&self, room: &str) -> anyhow::Result<()> {
        // Re-establish both directions; the publisher may have died with
        // the room as well.
        let need_publisher = {
            let publisher = self.publisher.lock().unwrap();
            publisher.as_ref().map(|p| !p.is_connected()).unwrap_or(true)
        };

        if need_publisher {
            let publisher = self.fabric.publish(room, &self.identity).await?;
            *self.publisher.lock().unwrap() = Some(publisher);
        }

        let subscription = self.fabric.subscribe_mix_minus(room, &self.identity).await?;
        *self.subscription.lock().unwrap() = Some(subscription);
        self.degraded.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn send_to_phone(&self, message: MediaMessage) {
        let mut guard = self.phone_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Bridge {} phone channel behind, frame dropped", self.identity);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Bridge {} phone channel closed", self.identity);
                    *guard = None;
                }
            }
        }
    }
}
