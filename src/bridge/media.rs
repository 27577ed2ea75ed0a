//! Framed control messages on the per-call media channel.
//!
//! One persistent bidirectional socket per active call carries these as
//! JSON text frames; `media` payloads are base64-encoded i16 PCM at the
//! telephony rate, one 20 ms frame per message.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediaMessage {
    /// First message on the channel, binding it to a call leg.
    Start { call_ref: String },
    /// One frame of encoded narrowband audio.
    Media { payload: String },
    /// Orderly end of the media stream.
    Stop,
}

pub fn encode_pcm(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_pcm(payload: &str) -> Result<Vec<i16>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("media payload is not valid base64")?;

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
