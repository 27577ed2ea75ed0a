//! The authoritative call/participant lifecycle tracker.
//!
//! Every mutation of a participant happens here, under that participant's
//! own lock: operations for different participants run concurrently, while
//! a near-simultaneous hangup and promote for the same participant are
//! serialized and cannot race into an inconsistent state.
//!
//! Transitions drive room (re)assignment and bridge state optimistically;
//! the reconciliation sweep repairs any drift afterwards. Notifier
//! publication is fire-and-forget and never gates a transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::episode::{Episode, EpisodeStore};
use super::error::LifecycleError;
use super::participant::{CallerState, Participant};
use crate::audio::MixerGraph;
use crate::bridge::{BridgeConfig, BridgeEvent, BridgeSession, BRIDGE_EVENT_CAPACITY};
use crate::fabric::ConferencingFabric;
use crate::notify::{Notifier, ParticipantStateChanged, StudioEvent};
use crate::rooms::{RoomClass, RoomManager};

#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Bounded total wait for the episode record to exist after signaling.
    pub admit_timeout: Duration,
    pub admit_poll: Duration,
    pub bridge: BridgeConfig,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            admit_timeout: Duration::from_secs(5),
            admit_poll: Duration::from_millis(250),
            bridge: BridgeConfig::default(),
        }
    }
}

pub struct CallDirector {
    episodes: Arc<dyn EpisodeStore>,
    rooms: Arc<RoomManager>,
    fabric: Arc<dyn ConferencingFabric>,
    notifier: Arc<dyn Notifier>,
    mixer: Arc<MixerGraph>,
    /// Process-wide registry; each participant behind its own lock.
    participants: RwLock<HashMap<Uuid, Arc<Mutex<Participant>>>>,
    bridges: RwLock<HashMap<Uuid, Arc<BridgeSession>>>,
    /// Active screening sessions, keyed by screener identity.
    screening: Mutex<HashMap<String, Uuid>>,
    bridge_events: mpsc::Sender<BridgeEvent>,
    config: DirectorConfig,
}

impl CallDirector {
    /// Build the director; the returned receiver carries bridge lifecycle
    /// events for the room manager.
    pub fn new(
        episodes: Arc<dyn EpisodeStore>,
        rooms: Arc<RoomManager>,
        fabric: Arc<dyn ConferencingFabric>,
        notifier: Arc<dyn Notifier>,
        mixer: Arc<MixerGraph>,
        config: DirectorConfig,
    ) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(BRIDGE_EVENT_CAPACITY);
        let director = Arc::new(Self {
            episodes,
            rooms,
            fabric,
            notifier,
            mixer,
            participants: RwLock::new(HashMap::new()),
            bridges: RwLock::new(HashMap::new()),
            screening: Mutex::new(HashMap::new()),
            bridge_events: tx,
            config,
        });
        (director, rx)
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Admit an inbound caller: create the participant `queued` in the
    /// episode lobby, muted, with a bridge session bound to the lobby.
    ///
    /// Signaling and episode-record creation are independently deployed and
    /// race; admission polls for the record with a bounded total wait
    /// before abandoning the call. Any open non-terminal record for the
    /// same caller on this episode is force-completed first (stale-session
    /// cleanup), making admission idempotent per caller.
    pub async fn admit(&self, caller_ref: &str) -> Result<Uuid, LifecycleError> {
        let episode = self.wait_for_episode(caller_ref).await?;

        for stale in self.stale_records(caller_ref, &episode.id).await {
            warn!(
                "Force-completing stale record {} for caller {} on episode {}",
                stale, caller_ref, episode.id
            );
            if let Err(e) = self.complete(stale).await {
                warn!("Stale-record cleanup for {} failed: {}", stale, e);
            }
        }

        self.rooms
            .create_room(&episode.lobby_room, RoomClass::Lobby)
            .await
            .map_err(|e| LifecycleError::ResourceBusy {
                reason: format!("lobby room unavailable: {}", e),
            })?;

        let mut participant = Participant::new(caller_ref, episode.id.clone());
        participant.room = Some(episode.lobby_room.clone());
        let id = participant.id;
        let identity = participant.identity();

        let bridge = BridgeSession::connect(
            id,
            identity,
            Arc::clone(&self.fabric),
            &episode.lobby_room,
            self.bridge_events.clone(),
            self.config.bridge.clone(),
        )
        .await;
        bridge.set_muted(true);

        self.notify_state(&participant);
        self.participants
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(participant)));
        self.bridges.write().await.insert(id, bridge);

        info!("Admitted caller {} as participant {} (queued)", caller_ref, id);
        Ok(id)
    }

    /// `queued -> screening`: a fresh per-participant screening room is
    /// created and the bridge moves there, unmuted for the private
    /// conversation. One active screening session per screener.
    pub async fn pick_up(&self, id: Uuid, screener: &str) -> Result<(), LifecycleError> {
        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;

        if p.state != CallerState::Queued {
            return Err(LifecycleError::InvalidTransition {
                action: "pick up",
                state: p.state,
            });
        }

        {
            let mut screening = self.screening.lock().await;
            if let Some(active) = screening.get(screener) {
                if *active != id {
                    return Err(LifecycleError::AlreadyScreening {
                        screener: screener.to_string(),
                    });
                }
            }
            screening.insert(screener.to_string(), id);
        }

        let room_id = format!("screen-{}", id);
        if let Err(e) = self.rooms.create_room(&room_id, RoomClass::Screening).await {
            self.screening.lock().await.remove(screener);
            return Err(LifecycleError::ResourceBusy {
                reason: format!("screening room unavailable: {}", e),
            });
        }

        self.move_bridge(id, &room_id).await;

        p.set_state(CallerState::Screening);
        p.room = Some(room_id);
        p.screener = Some(screener.to_string());
        p.muted = false;
        self.set_bridge_muted(id, false).await;

        self.notify_state(&p);
        info!("Participant {} picked up by {}", id, screener);
        Ok(())
    }

    /// `screening -> hold`: approved caller parks in the episode's on-air
    /// room. Mute stays on: the caller hears the room, is not heard.
    pub async fn approve(&self, id: Uuid, notes: Option<String>) -> Result<(), LifecycleError> {
        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;

        if p.state != CallerState::Screening {
            return Err(LifecycleError::InvalidTransition {
                action: "approve",
                state: p.state,
            });
        }

        let episode = self.episode_of(&p).await;
        self.rooms
            .create_room(&episode.onair_room, RoomClass::OnAir)
            .await
            .map_err(|e| LifecycleError::ResourceBusy {
                reason: format!("on-air room unavailable: {}", e),
            })?;

        let old_room = p.room.clone();
        self.move_bridge(id, &episode.onair_room).await;

        self.release_screener_guard(id).await;

        p.set_state(CallerState::Hold);
        p.room = Some(episode.onair_room.clone());
        p.muted = true;
        p.approval_notes = notes;
        self.set_bridge_muted(id, true).await;

        self.notify_state(&p);

        // The per-participant screening room is done; destroy (or defer).
        if let Some(old_room) = old_room {
            if let Err(e) = self.rooms.destroy_room(&old_room).await {
                warn!("Screening room {} cleanup failed: {}", old_room, e);
            }
        }

        info!("Participant {} approved, holding in {}", id, episode.onair_room);
        Ok(())
    }

    /// `hold -> screening`: send an approved caller back to their screener
    /// (the reversible screening edge).
    pub async fn rescreen(&self, id: Uuid) -> Result<(), LifecycleError> {
        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;

        if p.state != CallerState::Hold {
            return Err(LifecycleError::InvalidTransition {
                action: "rescreen",
                state: p.state,
            });
        }

        let Some(screener) = p.screener.clone() else {
            return Err(LifecycleError::InvalidTransition {
                action: "rescreen",
                state: p.state,
            });
        };

        {
            let mut screening = self.screening.lock().await;
            if let Some(active) = screening.get(&screener) {
                if *active != id {
                    return Err(LifecycleError::AlreadyScreening { screener });
                }
            }
            screening.insert(screener.clone(), id);
        }

        let room_id = format!("screen-{}", id);
        if let Err(e) = self.rooms.create_room(&room_id, RoomClass::Screening).await {
            self.screening.lock().await.remove(&screener);
            return Err(LifecycleError::ResourceBusy {
                reason: format!("screening room unavailable: {}", e),
            });
        }

        self.move_bridge(id, &room_id).await;

        p.set_state(CallerState::Screening);
        p.room = Some(room_id);
        p.muted = false;
        self.set_bridge_muted(id, false).await;

        self.notify_state(&p);
        info!("Participant {} returned to screening with {}", id, screener);
        Ok(())
    }

    /// `hold -> on-air`: unmute the bridged leg. The room does not change,
    /// so there is no rejoin latency.
    pub async fn put_on_air(&self, id: Uuid) -> Result<(), LifecycleError> {
        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;

        if p.state != CallerState::Hold || p.room.is_none() {
            return Err(LifecycleError::InvalidTransition {
                action: "put on air",
                state: p.state,
            });
        }

        p.set_state(CallerState::OnAir);
        p.muted = false;
        self.set_bridge_muted(id, false).await;

        self.notify_state(&p);
        info!("Participant {} is on air", id);
        Ok(())
    }

    /// `on-air -> hold`: mute without detaching from the room.
    pub async fn put_on_hold(&self, id: Uuid) -> Result<(), LifecycleError> {
        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;

        if p.state != CallerState::OnAir {
            return Err(LifecycleError::InvalidTransition {
                action: "put on hold",
                state: p.state,
            });
        }

        p.set_state(CallerState::Hold);
        p.muted = true;
        self.set_bridge_muted(id, true).await;

        self.notify_state(&p);
        info!("Participant {} placed on hold", id);
        Ok(())
    }

    /// Any non-terminal state -> `completed`. Idempotent against redelivery:
    /// a duplicate hangup on a finished participant is a no-op.
    pub async fn complete(&self, id: Uuid) -> Result<(), LifecycleError> {
        self.terminate(id, CallerState::Completed).await
    }

    /// Any non-terminal state -> `rejected`.
    pub async fn reject(&self, id: Uuid) -> Result<(), LifecycleError> {
        self.terminate(id, CallerState::Rejected).await
    }

    async fn terminate(&self, id: Uuid, outcome: CallerState) -> Result<(), LifecycleError> {
        debug_assert!(outcome.is_terminal());

        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;

        if p.is_terminal() {
            debug!("Replayed terminal event for {} ignored", id);
            return Ok(());
        }

        // Fixed teardown order: bridge loops stop and leave the room,
        // then owned mixer sources detach, then the terminal mark.
        let bridge = self.bridges.write().await.remove(&id);
        if let Some(bridge) = bridge {
            bridge.shutdown().await;
        }

        if let Some(room) = p.room.clone() {
            self.rooms.apply_membership(&room, &p.identity(), false).await;
        }

        for source in p.sources.drain(..) {
            self.mixer.detach_source(&source);
        }

        let screening_room = format!("screen-{}", id);
        if self.rooms.room(&screening_room).await.is_some() {
            if let Err(e) = self.rooms.destroy_room(&screening_room).await {
                warn!("Screening room {} cleanup failed: {}", screening_room, e);
            }
        }

        self.release_screener_guard(id).await;

        p.set_state(outcome);
        p.room = None;
        self.notify_state(&p);

        info!("Participant {} terminal: {}", id, outcome);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Rebuild the in-memory registry from persisted non-terminal records
    /// (startup recovery scan). Terminal records are skipped.
    pub async fn recover(&self, records: Vec<Participant>) {
        for record in records {
            if record.is_terminal() {
                continue;
            }

            let id = record.id;
            let identity = record.identity();
            let room = record.room.clone();

            info!("Recovering participant {} ({})", id, record.state);
            self.participants
                .write()
                .await
                .insert(id, Arc::new(Mutex::new(record)));

            if let Some(room) = room {
                let bridge = BridgeSession::connect(
                    id,
                    identity,
                    Arc::clone(&self.fabric),
                    &room,
                    self.bridge_events.clone(),
                    self.config.bridge.clone(),
                )
                .await;
                self.bridges.write().await.insert(id, bridge);
            }
        }
    }

    /// Signal every owned session to release its resources (shutdown path).
    pub async fn shutdown(&self) {
        let bridges: Vec<Arc<BridgeSession>> =
            self.bridges.write().await.drain().map(|(_, b)| b).collect();
        let count = bridges.len();
        for bridge in bridges {
            bridge.shutdown().await;
        }
        self.mixer.detach_all();
        info!("Call director shut down ({} bridges released)", count);
    }

    pub async fn participant(&self, id: Uuid) -> Option<Participant> {
        let handle = {
            let participants = self.participants.read().await;
            participants.get(&id).cloned()
        }?;
        let p = handle.lock().await;
        Some(p.clone())
    }

    pub async fn participants_snapshot(&self) -> Vec<Participant> {
        let handles: Vec<Arc<Mutex<Participant>>> =
            self.participants.read().await.values().cloned().collect();

        let mut snapshot = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshot.push(handle.lock().await.clone());
        }
        snapshot
    }

    pub async fn bridge(&self, id: Uuid) -> Option<Arc<BridgeSession>> {
        self.bridges.read().await.get(&id).cloned()
    }

    pub(crate) async fn remove_bridge(&self, id: Uuid) -> Option<Arc<BridgeSession>> {
        self.bridges.write().await.remove(&id)
    }

    pub async fn bridge_ids(&self) -> Vec<Uuid> {
        self.bridges.read().await.keys().copied().collect()
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn mixer(&self) -> &Arc<MixerGraph> {
        &self.mixer
    }

    /// Record mixer sources owned by a participant so teardown detaches them.
    pub async fn track_source(&self, id: Uuid, source: impl Into<String>) -> Result<(), LifecycleError> {
        let handle = self.participant_handle(id).await?;
        let mut p = handle.lock().await;
        p.sources.push(source.into());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn wait_for_episode(&self, caller_ref: &str) -> Result<Episode, LifecycleError> {
        let deadline = tokio::time::Instant::now() + self.config.admit_timeout;

        loop {
            if let Some(episode) = self.episodes.current().await {
                return Ok(episode);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "No episode record appeared within {:?}; abandoning caller {}",
                    self.config.admit_timeout, caller_ref
                );
                return Err(LifecycleError::NoLiveEpisode {
                    caller_ref: caller_ref.to_string(),
                });
            }
            tokio::time::sleep(self.config.admit_poll).await;
        }
    }

    async fn stale_records(&self, caller_ref: &str, episode_id: &str) -> Vec<Uuid> {
        let handles: Vec<Arc<Mutex<Participant>>> =
            self.participants.read().await.values().cloned().collect();

        let mut stale = Vec::new();
        for handle in handles {
            let p = handle.lock().await;
            // Scoped to the current episode: parallel records on other
            // episodes are left alone.
            if p.caller_ref == caller_ref && p.episode_id == episode_id && !p.is_terminal() {
                stale.push(p.id);
            }
        }
        stale
    }

    async fn participant_handle(
        &self,
        id: Uuid,
    ) -> Result<Arc<Mutex<Participant>>, LifecycleError> {
        self.participants
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LifecycleError::UnknownParticipant { id })
    }

    /// Reassign the participant's bridge. Fabric-side failures degrade the
    /// bridge rather than failing the transition; the reconciliation sweep
    /// repairs them.
    async fn move_bridge(&self, id: Uuid, room: &str) {
        let bridge = self.bridges.read().await.get(&id).cloned();
        if let Some(bridge) = bridge {
            if let Err(e) = bridge.reassign(room).await {
                warn!(
                    "Bridge reassignment for {} to {} failed (will reconcile): {}",
                    id, room, e
                );
            }
        }
    }

    async fn set_bridge_muted(&self, id: Uuid, muted: bool) {
        if let Some(bridge) = self.bridges.read().await.get(&id) {
            bridge.set_muted(muted);
        }
    }

    async fn release_screener_guard(&self, id: Uuid) {
        let mut screening = self.screening.lock().await;
        screening.retain(|_, active| *active != id);
    }

    async fn episode_of(&self, p: &Participant) -> Episode {
        match self.episodes.get(&p.episode_id).await {
            Some(episode) => episode,
            // The record may have rotated out of the store; room names are
            // derived deterministically from the episode id.
            None => Episode::new(p.episode_id.clone()),
        }
    }

    fn notify_state(&self, p: &Participant) {
        let event = StudioEvent::ParticipantStateChanged(ParticipantStateChanged {
            episode_id: p.episode_id.clone(),
            participant_id: p.id,
            caller_ref: p.caller_ref.clone(),
            state: p.state.as_str().to_string(),
            room: p.room.clone(),
            muted: p.muted,
            at: chrono::Utc::now(),
        });

        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.publish(&event).await {
                warn!("Notifier publish failed (ignored): {}", e);
            }
        });
    }

    /// Prune screener-guard entries whose participant is gone or terminal.
    /// Called by the reconciliation sweep.
    pub(crate) async fn prune_screening_guards(&self) {
        let snapshot = self.participants_snapshot().await;
        let mut screening = self.screening.lock().await;
        screening.retain(|screener, id| {
            let alive = snapshot
                .iter()
                .any(|p| p.id == *id && p.state == CallerState::Screening);
            if !alive {
                debug!("Pruned stale screening guard for {}", screener);
            }
            alive
        });
    }
}
