//! Wire format towards the streaming service.
//!
//! Text messages carry JSON control frames:
//!
//! ```text
//! {"type":"start","deviceId":"kitchen-01","fmt":"pcm16_le","sampleRate":16000,
//!  "frameSamples":320,"channels":1,"endian":"le","gain":1.0}
//! {"type":"stop"}
//! ```
//!
//! Binary messages carry exactly one frame of little-endian PCM16, with no
//! header.

use serde::{Deserialize, Serialize};

/// Format parameters announced at the start of an utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub device_id: String,
    pub fmt: String,
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub channels: u16,
    pub endian: String,
    pub gain: f32,
}

impl StartInfo {
    /// Mono PCM16 little-endian at `sample_rate`.
    pub fn pcm16_mono(device_id: &str, sample_rate: u32, frame_samples: usize, gain: f32) -> Self {
        Self {
            device_id: device_id.into(),
            fmt: "pcm16_le".into(),
            sample_rate,
            frame_samples,
            channels: 1,
            endian: "le".into(),
            gain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Start(StartInfo),
    Stop,
}

impl ControlMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Serialise one frame as raw little-endian PCM16.
pub fn encode_frame(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
