//! Device settings structs, defaults and TOML persistence.
//!
//! Every struct is `#[serde(default)]`, so a `settings.toml` that names only
//! a few keys is filled up with the defaults below.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// DeviceConfig
// ---------------------------------------------------------------------------

/// Identity of this device towards the streaming service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Sent as `deviceId` in every start-of-utterance message.
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: std::env::var("HOSTNAME").unwrap_or_else(|_| "wake-stream".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Microphone and engine block geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Rate the microphone adapter converts to, in Hz.
    pub sample_rate: u32,
    /// Interleaved channels the engine is fed with.
    pub channels: usize,
    /// Samples per channel in one engine block.
    pub chunk_samples: usize,
    /// Input gain applied by the microphone adapter, in dB.
    pub input_gain_db: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_samples: 320,
            input_gain_db: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// DetectionConfig
// ---------------------------------------------------------------------------

/// Utterance tracking, ring sizing and analysis-thread housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Frame slots in the ring between analysis and streaming.
    pub ring_capacity: usize,
    /// Frames ignored right after the wake word is verified.
    pub drop_guard_frames: usize,
    /// Consecutive silence frames that end an utterance.
    pub silence_frames_to_idle: usize,
    /// Smoothing factor of the ring's drop-rate EMA.
    pub drop_rate_alpha: f32,
    /// Log ring statistics every N analysed frames (0 disables).
    pub stats_every_frames: u64,
    /// How long session teardown waits for each thread.
    pub shutdown_timeout_ms: u64,
    /// How often teardown checks whether a thread has exited.
    pub shutdown_poll_ms: u64,
    /// RMS level above which the energy engine reports a wake onset.
    pub wake_threshold: f32,
    /// RMS level above which the energy engine reports speech.
    pub vad_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 16,
            drop_guard_frames: 3,
            silence_frames_to_idle: 40,
            drop_rate_alpha: 0.05,
            stats_every_frames: 50,
            shutdown_timeout_ms: 2_000,
            shutdown_poll_ms: 10,
            wake_threshold: 0.10,
            vad_threshold: 0.02,
        }
    }
}

impl DetectionConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// StreamConfig
// ---------------------------------------------------------------------------

/// Streaming endpoint, timeouts, heartbeat and backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// `wss://` instead of `ws://`.
    pub use_tls: bool,
    /// Full endpoint URI; overrides `host`/`port`/`path`/`use_tls` when set.
    pub endpoint: Option<String>,
    /// Keep the connection open across utterances.
    pub keep_open: bool,
    pub connect_timeout_ms: u64,
    /// How long a fresh connection waits for speech before giving up.
    pub start_timeout_ms: u64,
    /// Pause after the stop message so the peer can process tail frames.
    pub flush_delay_ms: u64,
    pub send_timeout_ms: u64,
    /// Back-off when the ring is empty during an utterance.
    pub idle_backoff_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Unanswered pings tolerated before the connection is force-closed.
    pub heartbeat_max_missed: u32,
    pub retry_delay_ms: u64,
    /// In-flight bytes above which draining pauses.
    pub soft_backlog_bytes: usize,
    /// Frames kept in the ring when speech starts.
    pub preroll_frames: usize,
    /// Advertised in the start message.
    pub gain: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9090,
            path: "/realtime".into(),
            use_tls: false,
            endpoint: None,
            keep_open: false,
            connect_timeout_ms: 10_000,
            start_timeout_ms: 500,
            flush_delay_ms: 500,
            send_timeout_ms: 200,
            idle_backoff_ms: 1,
            heartbeat_interval_ms: 15_000,
            heartbeat_max_missed: 2,
            retry_delay_ms: 3_000,
            soft_backlog_bytes: 256 * 1024,
            preroll_frames: 2,
            gain: 1.0,
        }
    }
}

impl StreamConfig {
    /// The WebSocket URI to connect to.
    ///
    /// ```rust
    /// use wake_stream::config::StreamConfig;
    ///
    /// let mut cfg = StreamConfig::default();
    /// assert_eq!(cfg.uri(), "ws://127.0.0.1:9090/realtime");
    /// cfg.use_tls = true;
    /// cfg.path = "audio".into();
    /// assert_eq!(cfg.uri(), "wss://127.0.0.1:9090/audio");
    /// ```
    pub fn uri(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        let scheme = if self.use_tls { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use wake_stream::config::AppConfig;
///
/// // Defaults when the file does not exist yet.
/// let config = AppConfig::load().unwrap();
/// println!("streaming to {}", config.stream.uri());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub audio: AudioConfig,
    pub detection: DetectionConfig,
    pub stream: StreamConfig,
}

impl AppConfig {
    /// Load from the platform `settings.toml`, or defaults if it is missing.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path, or defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save to the platform `settings.toml`, creating directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
