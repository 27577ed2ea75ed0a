//! Real-time mixing graph.
//!
//! Every source is wired through its own gain stage into the master bus.
//! The per-frame pass runs: per-source gain → per-source level tap → sum →
//! soft-knee compression → master level tap → sinks.
//!
//! Structural changes (attach/detach) rebuild a copy-on-write snapshot of
//! the node list; the frame pass clones the snapshot `Arc` and never holds
//! the structural lock, so no node appears or vanishes mid-frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::compressor::Compressor;
use super::forwarder::SinkForwarder;
use super::frame::{accumulate, frame_interval, AudioFrame, FABRIC_SAMPLE_RATE, FRAME_MS};
use super::level::{level_of, level_of_bus};
use super::recorder::MasterRecorder;
use super::ring::{feed_pair, FeedConsumer, FeedProducer};
use super::source::{start_microphone_capture, CaptureHandle, SourceId, SourceKind};
use crate::fabric::ConferencingFabric;

#[derive(Debug, Error)]
pub enum AudioGraphError {
    #[error("source {0} is already attached")]
    DuplicateSource(SourceId),
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("recording is already running")]
    AlreadyRecording,
    #[error("no recording is running")]
    NotRecording,
}

#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Master bus sample rate.
    pub sample_rate: u32,
    /// Channel count of the master bus (mono broadcast output).
    pub channels: u16,
    /// Per-source feed capacity in samples.
    pub feed_capacity: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: FABRIC_SAMPLE_RATE,
            channels: 1,
            // One second of buffered feed per source.
            feed_capacity: FABRIC_SAMPLE_RATE as usize,
        }
    }
}

/// One mixer input: gain stage, mute, level tap, and its sample feed.
pub struct SourceNode {
    pub id: SourceId,
    kind: Mutex<SourceKind>,
    kind_name: &'static str,
    volume: AtomicU8,
    muted: AtomicBool,
    level: AtomicU8,
    feed: Mutex<FeedConsumer>,
}

impl SourceNode {
    pub fn kind_name(&self) -> &'static str {
        self.kind_name
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

pub struct MixerGraph {
    config: MixerConfig,
    nodes: Mutex<HashMap<SourceId, Arc<SourceNode>>>,
    snapshot: RwLock<Arc<Vec<Arc<SourceNode>>>>,
    compressor: Mutex<Compressor>,
    master_level: AtomicU8,
    forwarder: SinkForwarder,
    recorder: Mutex<Option<MasterRecorder>>,
    running: AtomicBool,
    clock_ms: AtomicU64,
    frame_task: Mutex<Option<JoinHandle<()>>>,
}

impl MixerGraph {
    pub fn new(config: MixerConfig) -> Self {
        info!(
            "Mixer graph initialized: {}Hz, {} channels",
            config.sample_rate, config.channels
        );

        let sample_rate = config.sample_rate;
        Self {
            config,
            nodes: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            compressor: Mutex::new(Compressor::new(sample_rate)),
            master_level: AtomicU8::new(0),
            forwarder: SinkForwarder::new(),
            recorder: Mutex::new(None),
            running: AtomicBool::new(false),
            clock_ms: AtomicU64::new(0),
            frame_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    fn frame_samples(&self) -> usize {
        (self.config.sample_rate as usize / 1000) * FRAME_MS as usize * self.config.channels as usize
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    /// Wire a new source into the master bus.
    ///
    /// Returns the feed producer the caller pushes samples through.
    /// All-or-nothing: a duplicate id registers no partial node.
    pub fn attach_source(
        &self,
        id: impl Into<SourceId>,
        kind: SourceKind,
    ) -> Result<FeedProducer, AudioGraphError> {
        let id = id.into();
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&id) {
            return Err(AudioGraphError::DuplicateSource(id));
        }

        let (producer, consumer) = feed_pair(self.config.feed_capacity);
        let volume = kind.default_volume();
        let kind_name = kind.name();

        let node = Arc::new(SourceNode {
            id: id.clone(),
            kind: Mutex::new(kind),
            kind_name,
            volume: AtomicU8::new(volume),
            muted: AtomicBool::new(false),
            level: AtomicU8::new(0),
            feed: Mutex::new(consumer),
        });

        nodes.insert(id.clone(), node);
        self.rebuild_snapshot(&nodes);

        info!("Attached source {} ({}, volume {})", id, kind_name, volume);
        Ok(producer)
    }

    /// Attach the host microphone, owning its capture device.
    ///
    /// The device stream is opened first; on failure nothing is registered.
    pub fn attach_microphone(&self, id: impl Into<SourceId>) -> Result<(), AudioGraphError> {
        let id = id.into();
        {
            let nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&id) {
                return Err(AudioGraphError::DuplicateSource(id));
            }
        }

        let (producer, consumer) = feed_pair(self.config.feed_capacity);
        let handle = start_microphone_capture(producer, self.config.sample_rate)
            .map_err(|e| AudioGraphError::DeviceUnavailable(e.to_string()))?;

        self.attach_prewired(id, SourceKind::Microphone { handle }, consumer)
    }

    /// Attach a bridged phone caller; its bridge session pushes the frames.
    pub fn attach_bridged_caller(
        &self,
        id: impl Into<SourceId>,
        participant_id: Uuid,
    ) -> Result<FeedProducer, AudioGraphError> {
        self.attach_source(id, SourceKind::BridgedCaller { participant_id })
    }

    /// Subscribe a room's mix (minus `exclude` identity) as one mixer source.
    pub async fn attach_room_subscription(
        &self,
        id: impl Into<SourceId>,
        fabric: Arc<dyn ConferencingFabric>,
        room: &str,
        exclude: &str,
    ) -> Result<(), AudioGraphError> {
        let id = id.into();
        {
            let nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&id) {
                return Err(AudioGraphError::DuplicateSource(id));
            }
        }

        let mut subscription = fabric
            .subscribe_mix_minus(room, exclude)
            .await
            .map_err(|e| AudioGraphError::DeviceUnavailable(e.to_string()))?;

        let (mut producer, consumer) = feed_pair(self.config.feed_capacity);
        let room_name = room.to_string();

        let pump = tokio::spawn(async move {
            while let Some(samples) = subscription.recv().await {
                let dropped = producer.push(&samples);
                if dropped > 0 {
                    debug!("Room subscription feed full, dropped {} samples", dropped);
                }
            }
            debug!("Room subscription pump for {} ended", room_name);
        });

        let handle = CaptureHandle::new(move || pump.abort());
        self.attach_prewired(
            id,
            SourceKind::RoomSubscription {
                room: room.to_string(),
                handle,
            },
            consumer,
        )
    }

    fn attach_prewired(
        &self,
        id: SourceId,
        kind: SourceKind,
        consumer: FeedConsumer,
    ) -> Result<(), AudioGraphError> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&id) {
            // Lost the race to a concurrent attach; release what we opened.
            let mut kind = kind;
            kind.release();
            return Err(AudioGraphError::DuplicateSource(id));
        }

        let volume = kind.default_volume();
        let kind_name = kind.name();
        let node = Arc::new(SourceNode {
            id: id.clone(),
            kind: Mutex::new(kind),
            kind_name,
            volume: AtomicU8::new(volume),
            muted: AtomicBool::new(false),
            level: AtomicU8::new(0),
            feed: Mutex::new(consumer),
        });

        nodes.insert(id.clone(), node);
        self.rebuild_snapshot(&nodes);
        info!("Attached source {} ({}, volume {})", id, kind_name, volume);
        Ok(())
    }

    /// Disconnect a source and release its underlying handle.
    ///
    /// Idempotent: detaching an unknown or already-detached id is a no-op.
    /// A live capture device is released exactly once.
    pub fn detach_source(&self, id: &str) {
        let node = {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.remove(id);
            if node.is_some() {
                self.rebuild_snapshot(&nodes);
            }
            node
        };

        match node {
            Some(node) => {
                node.kind.lock().unwrap().release();
                info!("Detached source {} ({})", id, node.kind_name);
            }
            None => debug!("Detach of unknown source {} ignored", id),
        }
    }

    /// Detach everything; used on shutdown so every capture handle is freed.
    pub fn detach_all(&self) {
        let ids: Vec<SourceId> = self.nodes.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.detach_source(&id);
        }
    }

    fn rebuild_snapshot(&self, nodes: &HashMap<SourceId, Arc<SourceNode>>) {
        let mut list: Vec<Arc<SourceNode>> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        *self.snapshot.write().unwrap() = Arc::new(list);
    }

    // ------------------------------------------------------------------
    // Gain stage mutation
    // ------------------------------------------------------------------

    /// Set a source's volume (0-100). Mutates only the gain stage.
    pub fn set_volume(&self, id: &str, volume: u8) -> Result<(), AudioGraphError> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(id)
            .ok_or_else(|| AudioGraphError::UnknownSource(id.to_string()))?;
        node.volume.store(volume.min(100), Ordering::Relaxed);
        Ok(())
    }

    pub fn set_muted(&self, id: &str, muted: bool) -> Result<(), AudioGraphError> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(id)
            .ok_or_else(|| AudioGraphError::UnknownSource(id.to_string()))?;
        node.muted.store(muted, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metering
    // ------------------------------------------------------------------

    /// Latest post-gain level for one source (0-100), display only.
    pub fn level(&self, id: &str) -> Option<u8> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(id).map(|n| n.level.load(Ordering::Relaxed))
    }

    /// Latest master bus level (0-100), display only.
    pub fn master_level(&self) -> u8 {
        self.master_level.load(Ordering::Relaxed)
    }

    pub fn levels(&self) -> HashMap<SourceId, u8> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.level.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub fn start_recording(&self) -> Result<(), AudioGraphError> {
        let mut recorder = self.recorder.lock().unwrap();
        if recorder.is_some() {
            return Err(AudioGraphError::AlreadyRecording);
        }
        *recorder = Some(
            MasterRecorder::new(self.config.sample_rate, self.config.channels)
                .map_err(|e| AudioGraphError::DeviceUnavailable(e.to_string()))?,
        );
        Ok(())
    }

    /// Stop recording; returns the finalized WAV payload.
    pub fn stop_recording(&self) -> Result<Vec<u8>, AudioGraphError> {
        let recorder = self
            .recorder
            .lock()
            .unwrap()
            .take()
            .ok_or(AudioGraphError::NotRecording)?;
        recorder
            .finish()
            .map_err(|e| AudioGraphError::DeviceUnavailable(e.to_string()))
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().unwrap().is_some()
    }

    // ------------------------------------------------------------------
    // Sinks
    // ------------------------------------------------------------------

    pub fn add_sink(&self, name: impl Into<String>, capacity: usize) -> tokio::sync::mpsc::Receiver<AudioFrame> {
        self.forwarder.add_sink(name, capacity)
    }

    // ------------------------------------------------------------------
    // Frame clock
    // ------------------------------------------------------------------

    /// Run one frame-clock tick: drain every source feed, compose the master
    /// bus, and push the result to recording and relay sinks.
    ///
    /// Called by the spawned frame loop; exposed so embedders and tests can
    /// drive the graph deterministically.
    pub fn render_frame(&self) -> AudioFrame {
        let timestamp_ms = self.clock_ms.fetch_add(FRAME_MS, Ordering::Relaxed);
        let n = self.frame_samples();
        let snapshot = self.snapshot.read().unwrap().clone();

        let mut bus = vec![0i32; n];
        for node in snapshot.iter() {
            // Always drain the feed so a muted source does not back up.
            let samples = node.feed.lock().unwrap().read_frame(n);

            let gain = if node.muted.load(Ordering::Relaxed) {
                0.0
            } else {
                node.volume.load(Ordering::Relaxed) as f32 / 100.0
            };

            // Post-gain level tap; RMS scales linearly with gain.
            let level = (level_of(&samples) as f32 * gain).round().min(100.0) as u8;
            node.level.store(level, Ordering::Relaxed);

            if gain > 0.0 {
                accumulate(&mut bus, &samples, gain);
            }
        }

        let pre_level = level_of_bus(&bus);
        let samples = self.compressor.lock().unwrap().process(&bus);
        self.master_level.store(level_of(&samples), Ordering::Relaxed);

        if pre_level == 100 {
            debug!("Master bus at full scale before compression");
        }

        let frame = AudioFrame {
            samples,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            timestamp_ms,
        };

        {
            let mut recorder = self.recorder.lock().unwrap();
            if let Some(rec) = recorder.as_mut() {
                if let Err(e) = rec.write_frame(&frame) {
                    warn!("Recording write failed: {}", e);
                }
            }
        }

        self.forwarder.forward(&frame);
        frame
    }

    /// Spawn the continuous frame loop at the configured cadence.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Mixer frame loop already running");
            return;
        }

        let graph = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Mixer frame loop started ({}ms cadence)", FRAME_MS);

            while graph.running.load(Ordering::SeqCst) {
                interval.tick().await;
                graph.render_frame();
            }

            info!("Mixer frame loop stopped");
        });

        *self.frame_task.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.frame_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for MixerGraph {
    fn drop(&mut self) {
        self.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> MixerGraph {
        MixerGraph::new(MixerConfig::default())
    }

    #[test]
    fn test_attach_duplicate_rejected() {
        let g = graph();
        g.attach_bridged_caller("caller-1", Uuid::new_v4()).unwrap();
        let err = g.attach_bridged_caller("caller-1", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, AudioGraphError::DuplicateSource(_)));
        // The failed attach registered nothing extra.
        assert_eq!(g.source_ids().len(), 1);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let g = graph();
        g.attach_bridged_caller("caller-1", Uuid::new_v4()).unwrap();
        g.detach_source("caller-1");
        g.detach_source("caller-1");
        g.detach_source("never-attached");
        assert!(g.source_ids().is_empty());
    }

    #[test]
    fn test_volume_mutation_requires_known_source() {
        let g = graph();
        assert!(matches!(
            g.set_volume("ghost", 50),
            Err(AudioGraphError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_volume_clamped_to_100() {
        let g = graph();
        g.attach_bridged_caller("c", Uuid::new_v4()).unwrap();
        g.set_volume("c", 250).unwrap();
        let nodes = g.nodes.lock().unwrap();
        assert_eq!(nodes.get("c").unwrap().volume(), 100);
    }

    #[test]
    fn test_render_mixes_sources_into_master() {
        let g = graph();
        let mut feed = g.attach_bridged_caller("c", Uuid::new_v4()).unwrap();
        g.set_volume("c", 100).unwrap();

        feed.push(&vec![8000i16; g.frame_samples()]);
        let frame = g.render_frame();

        assert!(!frame.is_silent());
        assert!(g.level("c").unwrap() > 0);
        assert!(g.master_level() > 0);
    }

    #[test]
    fn test_muted_source_contributes_silence_but_drains() {
        let g = graph();
        let mut feed = g.attach_bridged_caller("c", Uuid::new_v4()).unwrap();
        g.set_muted("c", true).unwrap();

        feed.push(&vec![8000i16; g.frame_samples()]);
        let frame = g.render_frame();

        assert!(frame.is_silent());
        assert_eq!(g.level("c").unwrap(), 0);

        // Feed was drained even while muted: unmuting plays fresh audio.
        g.set_muted("c", false).unwrap();
        let frame = g.render_frame();
        assert!(frame.is_silent(), "stale muted audio must not leak out");
    }

    #[test]
    fn test_empty_graph_renders_silence() {
        let g = graph();
        let frame = g.render_frame();
        assert!(frame.is_silent());
        assert_eq!(g.master_level(), 0);
    }

    #[test]
    fn test_recording_captures_master_output() {
        let g = graph();
        g.start_recording().unwrap();
        assert!(matches!(
            g.start_recording(),
            Err(AudioGraphError::AlreadyRecording)
        ));

        g.render_frame();
        g.render_frame();

        let bytes = g.stop_recording().unwrap();
        assert!(bytes.len() > 44);
        assert!(matches!(g.stop_recording(), Err(AudioGraphError::NotRecording)));
    }
}
