//! In-memory WAV capture of the master bus.
//!
//! The recording accumulates in memory; `finish` returns the finalized WAV
//! payload for the external storage collaborator.

use anyhow::{Context, Result};
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use tracing::info;

use super::frame::AudioFrame;

/// A `Write + Seek` target whose bytes stay reachable after the WAV writer
/// consumes it on finalize.
#[derive(Clone)]
struct SharedBuffer {
    inner: Arc<Mutex<Cursor<Vec<u8>>>>,
}

impl SharedBuffer {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Cursor::new(Vec::new()))),
        }
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(self.inner.lock().unwrap().get_mut())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.lock().unwrap().flush()
    }
}

impl Seek for SharedBuffer {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.lock().unwrap().seek(pos)
    }
}

pub struct MasterRecorder {
    writer: Option<hound::WavWriter<SharedBuffer>>,
    buffer: SharedBuffer,
    sample_count: usize,
}

impl MasterRecorder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let buffer = SharedBuffer::new();
        let writer = hound::WavWriter::new(buffer.clone(), spec)
            .context("failed to create WAV writer for master recording")?;

        info!("Master recording started: {}Hz, {} channels", sample_rate, channels);

        Ok(Self {
            writer: Some(writer),
            buffer,
            sample_count: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &AudioFrame) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            for &sample in &frame.samples {
                writer
                    .write_sample(sample)
                    .context("failed to write sample to recording")?;
            }
            self.sample_count += frame.samples.len();
        }
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Finalize the WAV stream and return the encoded payload.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .context("failed to finalize master recording")?;
        }

        let bytes = self.buffer.take();
        info!(
            "Master recording finished: {} samples, {} bytes",
            self.sample_count,
            bytes.len()
        );
        Ok(bytes)
    }
}
