//! Detection engine interface.
//!
//! The engine does the wake-word, voice-activity and noise-suppression work.
//! The capture thread pushes raw microphone blocks in through
//! [`DetectionEngine::feed`]; the analysis thread pulls processed frames and
//! their classification out through [`DetectionEngine::fetch`].
//!
//! Block geometry is queried once when a session is built:
//!
//! ```text
//! feed block  = feed_chunk_size()  * feed_channels()   interleaved samples
//! fetch frame = fetch_chunk_size() * fetch_channels()  samples
//! ```

use thiserror::Error;

/// Wake-word channel state of one fetched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeState {
    None,
    Verified,
}

/// Voice-activity classification of one fetched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silence,
    Speech,
}

/// One processed frame from [`DetectionEngine::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub wake: WakeState,
    pub vad: VadState,
    pub pcm: Vec<i16>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine fetch failed: {0}")]
    Fetch(String),

    #[error("engine returned {actual} samples, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("engine reports an empty {0} block")]
    Geometry(&'static str),
}

pub trait DetectionEngine: Send + Sync {
    /// Hand one interleaved block to the engine.  Must not block for long;
    /// the engine queues internally.
    fn feed(&self, block: &[i16]);

    /// Wait for the next processed frame.
    ///
    /// `Ok(None)` means nothing arrived within the engine's own poll
    /// interval; callers use it to check whether they should keep running.
    /// `Err` is fatal for the session.
    fn fetch(&self) -> Result<Option<FetchResult>, EngineError>;

    fn enable_wake_word(&self);
    fn disable_wake_word(&self);

    fn feed_channels(&self) -> usize;
    fn feed_chunk_size(&self) -> usize;
    fn fetch_channels(&self) -> usize;
    fn fetch_chunk_size(&self) -> usize;
}

const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn DetectionEngine>) {}
};
