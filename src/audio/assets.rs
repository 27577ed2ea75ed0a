//! One-shot prerecorded asset playback.
//!
//! Assets (bumpers, sweepers, ad spots) are decoded with symphonia, trimmed
//! of trailing silence, and played through an ephemeral gain stage on the
//! mixer graph. Playback requests queue FIFO so back-to-back assets complete
//! in submission order with no audible gap between them.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::frame::{frame_interval, to_mono, FRAME_MS};
use super::graph::MixerGraph;
use super::resample::resample_linear;
use super::source::SourceKind;

/// Samples at or below this magnitude count as trailing silence.
const TRAILING_SILENCE_THRESHOLD: i16 = 200;

/// Observable completion of one queued asset.
pub struct AssetPlayback {
    finished: oneshot::Receiver<Result<(), String>>,
}

impl AssetPlayback {
    /// Resolves when the asset has fully played out (or failed to decode).
    pub async fn wait(self) -> Result<()> {
        match self.finished.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!(e)),
            Err(_) => Err(anyhow!("asset player stopped before playback finished")),
        }
    }
}

struct QueuedAsset {
    url: String,
    finished: oneshot::Sender<Result<(), String>>,
}

/// FIFO asset player bound to one mixer graph.
pub struct AssetPlayer {
    queue: mpsc::Sender<QueuedAsset>,
}

impl AssetPlayer {
    pub fn new(graph: Arc<MixerGraph>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_player(graph, rx));
        Self { queue: tx }
    }

    /// Queue an asset for playback. Completion is observable through the
    /// returned handle so assets can be sequenced back-to-back.
    pub async fn play(&self, url: impl Into<String>) -> Result<AssetPlayback> {
        let url = url.into();
        let (finished_tx, finished_rx) = oneshot::channel();
        self.queue
            .send(QueuedAsset {
                url,
                finished: finished_tx,
            })
            .await
            .map_err(|_| anyhow!("asset player is not running"))?;
        Ok(AssetPlayback {
            finished: finished_rx,
        })
    }
}

async fn run_player(graph: Arc<MixerGraph>, mut queue: mpsc::Receiver<QueuedAsset>) {
    info!("Asset player started");

    while let Some(asset) = queue.recv().await {
        let result = play_one(&graph, &asset.url).await;
        if let Err(e) = &result {
            warn!("Asset {} playback failed: {}", asset.url, e);
        }
        let _ = asset.finished.send(result.map_err(|e| e.to_string()));
    }

    info!("Asset player stopped");
}

async fn play_one(graph: &Arc<MixerGraph>, url: &str) -> Result<()> {
    let target_rate = graph.config().sample_rate;
    let path = url.to_string();

    let samples = tokio::task::spawn_blocking(move || decode_asset(&path, target_rate))
        .await
        .context("asset decode task failed")??;

    let samples = trim_trailing_silence(samples, TRAILING_SILENCE_THRESHOLD);
    if samples.is_empty() {
        debug!("Asset {} decoded to silence, skipping", url);
        return Ok(());
    }

    info!(
        "Playing asset {} ({:.1}s)",
        url,
        samples.len() as f64 / target_rate as f64
    );

    let source_id = format!("asset-{}", Uuid::new_v4());
    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    let mut feed = graph.attach_source(
        source_id.clone(),
        SourceKind::FilePlayback {
            done: Some(cancel_tx),
        },
    )?;

    let capacity = feed.free_space();
    let frame_samples = (target_rate as usize / 1000) * FRAME_MS as usize;
    let mut offset = 0;
    let mut interval = tokio::time::interval(frame_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Pace samples into the feed; stop early if the source is detached
    // out from under us.
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Asset {} detached mid-play", url);
                return Ok(());
            }
            _ = interval.tick() => {
                if offset < samples.len() {
                    let end = (offset + feed.free_space().min(frame_samples * 4)).min(samples.len());
                    if end > offset {
                        feed.push(&samples[offset..end]);
                        offset = end;
                    }
                } else if feed.free_space() == capacity {
                    // Everything pushed and the frame pass drained the feed.
                    break;
                }
            }
        }
    }

    graph.detach_source(&source_id);
    Ok(())
}

/// Decode an asset file to mono i16 at the mix rate.
fn decode_asset(path: &str, target_rate: u32) -> Result<Vec<i16>> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open asset {}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("unrecognized asset format")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("asset has no decodable track")?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(target_rate);
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1) as u16;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("failed to create asset decoder")?;

    let mut samples: Vec<i16> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(_)) => break, // end of stream
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("failed to read asset packet"),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable packet in {}: {}", path, e);
            }
            Err(e) => return Err(e).context("failed to decode asset packet"),
        }
    }

    let mono = to_mono(&samples, channels);
    Ok(resample_linear(&mono, source_rate, target_rate))
}

/// Drop the trailing run of samples at or below `threshold` magnitude,
/// bounding the silent gap between sequenced assets.
fn trim_trailing_silence(mut samples: Vec<i16>, threshold: i16) -> Vec<i16> {
    let last_audible = samples
        .iter()
        .rposition(|&s| s.abs() > threshold);
    match last_audible {
        Some(idx) => samples.truncate(idx + 1),
        None => samples.clear(),
    }
    samples
}
