//! Master-bus fan-out to recording and live-relay sinks.
//!
//! Sinks receive frames over bounded channels with `try_send`; a slow sink
//! loses frames rather than stalling the frame pass.

use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::frame::AudioFrame;

struct SinkEntry {
    name: String,
    tx: mpsc::Sender<AudioFrame>,
}

pub struct SinkForwarder {
    sinks: Mutex<Vec<SinkEntry>>,
}

impl SinkForwarder {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink and return its frame receiver.
    pub fn add_sink(&self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<AudioFrame> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity);
        info!("Registered master-bus sink: {}", name);
        self.sinks.lock().unwrap().push(SinkEntry { name, tx });
        rx
    }

    /// Push one master frame to every live sink. Never blocks; sinks whose
    /// receiver is gone are dropped from the list.
    pub fn forward(&self, frame: &AudioFrame) {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain(|sink| match sink.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Sink {} is behind, dropping frame", sink.name);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!("Sink {} closed, removing", sink.name);
                false
            }
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

impl Default for SinkForwarder {
    fn default() -> Self {
        Self::new()
    }
}
