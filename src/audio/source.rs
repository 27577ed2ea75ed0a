//! Mixer input sources.
//!
//! Every mixer input is one of a closed set of kinds. Capture-backed kinds
//! own a releasable handle; file playback carries its completion signal.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::ring::FeedProducer;

pub type SourceId = String;

/// Releasable handle over a live capture resource (device stream,
/// subscription pump task). Releasing is idempotent: the underlying
/// resource is torn down exactly once.
pub struct CaptureHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle with nothing to release (used by tests and pure feeds).
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// The closed set of mixer input kinds.
pub enum SourceKind {
    /// Host microphone; owns the capture device stream.
    Microphone { handle: CaptureHandle },
    /// One bridged phone caller; frames are pushed by its bridge session.
    BridgedCaller { participant_id: Uuid },
    /// Subscription to a conferencing room's mix; owns the pump task.
    RoomSubscription { room: String, handle: CaptureHandle },
    /// One-shot prerecorded asset; resolves its completion signal on detach.
    FilePlayback { done: Option<oneshot::Sender<()>> },
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Microphone { .. } => "microphone",
            SourceKind::BridgedCaller { .. } => "bridged-caller",
            SourceKind::RoomSubscription { .. } => "room-subscription",
            SourceKind::FilePlayback { .. } => "file-playback",
        }
    }

    /// Kind-dependent default gain: the host microphone sits high in the
    /// mix, bridged and room sources moderate to limit summation clipping.
    pub fn default_volume(&self) -> u8 {
        match self {
            SourceKind::Microphone { .. } => 85,
            SourceKind::BridgedCaller { .. } => 60,
            SourceKind::RoomSubscription { .. } => 60,
            SourceKind::FilePlayback { .. } => 70,
        }
    }

    /// Tear down whatever the kind owns. Idempotent.
    pub fn release(&mut self) {
        match self {
            SourceKind::Microphone { handle } => handle.release(),
            SourceKind::RoomSubscription { handle, .. } => handle.release(),
            SourceKind::FilePlayback { done } => {
                if let Some(done) = done.take() {
                    let _ = done.send(());
                }
            }
            SourceKind::BridgedCaller { .. } => {}
        }
    }
}

/// Start capturing the default input device into `feed`.
///
/// The cpal stream lives on a dedicated thread (streams are not `Send`);
/// the callback converts to mono i16 and pushes into the lock-free feed.
/// Returns the handle that stops the stream, or `ResourceBusy`-style error
/// when no device is available.
pub fn start_microphone_capture(mut feed: FeedProducer, sample_rate: u32) -> Result<CaptureHandle> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("no input device available for host microphone")?;

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    info!("Host microphone using device: {}", device_name);

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

    std::thread::Builder::new()
        .name("mic-capture".to_string())
        .spawn(move || {
            let err_fn = |err| error!("Microphone stream error: {}", err);

            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                        .collect();
                    let dropped = feed.push(&samples);
                    if dropped > 0 {
                        debug!("Microphone feed full, dropped {} samples", dropped);
                    }
                },
                err_fn,
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(anyhow::anyhow!("failed to open input stream: {}", e)));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(anyhow::anyhow!("failed to start input stream: {}", e)));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            // Keep the stream alive until released.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Microphone capture thread stopped");
        })
        .context("failed to spawn microphone capture thread")?;

    ready_rx
        .recv()
        .context("microphone capture thread exited before reporting readiness")??;

    Ok(CaptureHandle::new(move || {
        let _ = stop_tx.send(());
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_capture_handle_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut handle = CaptureHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        handle.release();
        handle.release();
        drop(handle);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capture_handle_releases_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        {
            let _handle = CaptureHandle::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_volumes_by_kind() {
        let mic = SourceKind::Microphone {
            handle: CaptureHandle::noop(),
        };
        let caller = SourceKind::BridgedCaller {
            participant_id: Uuid::new_v4(),
        };
        assert!(mic.default_volume() > caller.default_volume());
    }

    #[test]
    fn test_file_playback_release_fires_completion() {
        let (tx, mut rx) = oneshot::channel();
        let mut kind = SourceKind::FilePlayback { done: Some(tx) };
        kind.release();
        assert!(rx.try_recv().is_ok());
        // Second release is a no-op.
        kind.release();
    }
}
