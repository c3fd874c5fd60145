//! Level-based stand-in for a real detection engine.
//!
//! Lets the device run end to end on a desktop host without vendor DSP.
//! There is no keyword spotting here: a short run of loud frames while the
//! wake word is enabled counts as "verified", and any frame whose RMS is
//! above the VAD threshold counts as speech.
//!
//! `feed` downmixes to mono, slices fixed-size frames, classifies them and
//! queues the results on a bounded channel; `fetch` pops with a short
//! timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::rms;
use crate::config::{AudioConfig, DetectionConfig};

use super::engine::{DetectionEngine, EngineError, FetchResult, VadState, WakeState};

/// Loud frames in a row that count as a wake word.
const ONSET_FRAMES: usize = 3;
/// Results buffered between feed and fetch before new ones are dropped.
const QUEUE_DEPTH: usize = 64;
const FETCH_POLL: Duration = Duration::from_millis(100);

struct Analyzer {
    pending: Vec<i16>,
    loud_run: usize,
}

pub struct EnergyEngine {
    feed_channels: usize,
    chunk: usize,
    wake_threshold: f32,
    vad_threshold: f32,
    wake_enabled: AtomicBool,
    analyzer: Mutex<Analyzer>,
    tx: mpsc::SyncSender<FetchResult>,
    rx: Mutex<mpsc::Receiver<FetchResult>>,
}

impl EnergyEngine {
    pub fn new(audio: &AudioConfig, detection: &DetectionConfig) -> Self {
        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        Self {
            feed_channels: audio.channels.max(1),
            chunk: audio.chunk_samples.max(1),
            wake_threshold: detection.wake_threshold,
            vad_threshold: detection.vad_threshold,
            wake_enabled: AtomicBool::new(true),
            analyzer: Mutex::new(Analyzer {
                pending: Vec::with_capacity(audio.chunk_samples * 2),
                loud_run: 0,
            }),
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn classify(&self, analyzer: &mut Analyzer, pcm: Vec<i16>) -> FetchResult {
        let level = rms(&pcm);

        let vad = if level > self.vad_threshold {
            VadState::Speech
        } else {
            VadState::Silence
        };

        let mut wake = WakeState::None;
        if level > self.wake_threshold && self.wake_enabled.load(Ordering::Acquire) {
            analyzer.loud_run += 1;
            if analyzer.loud_run == ONSET_FRAMES {
                wake = WakeState::Verified;
            }
        } else {
            analyzer.loud_run = 0;
        }

        FetchResult { wake, vad, pcm }
    }
}

impl DetectionEngine for EnergyEngine {
    fn feed(&self, block: &[i16]) {
        let mut analyzer = self.analyzer.lock();

        let channels = self.feed_channels;
        analyzer.pending.extend(block.chunks_exact(channels).map(|frame| {
            (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16
        }));

        while analyzer.pending.len() >= self.chunk {
            let pcm: Vec<i16> = analyzer.pending.drain(..self.chunk).collect();
            let result = self.classify(&mut analyzer, pcm);
            if self.tx.try_send(result).is_err() {
                log::trace!("energy-engine: result queue full, frame dropped");
            }
        }
    }

    fn fetch(&self) -> Result<Option<FetchResult>, EngineError> {
        match self.rx.lock().recv_timeout(FETCH_POLL) {
            Ok(result) => Ok(Some(result)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(EngineError::Fetch("result queue closed".into()))
            }
        }
    }

    fn enable_wake_word(&self) {
        self.wake_enabled.store(true, Ordering::Release);
    }

    fn disable_wake_word(&self) {
        self.wake_enabled.store(false, Ordering::Release);
        self.analyzer.lock().loud_run = 0;
    }

    fn feed_channels(&self) -> usize {
        self.feed_channels
    }

    fn feed_chunk_size(&self) -> usize {
        self.chunk
    }

    fn fetch_channels(&self) -> usize {
        1
    }

    fn fetch_chunk_size(&self) -> usize {
        self.chunk
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(channels: usize) -> EnergyEngine {
        let audio = AudioConfig {
            channels,
            chunk_samples: 4,
            ..AudioConfig::default()
        };
        let detection = DetectionConfig {
            wake_threshold: 0.5,
            vad_threshold: 0.1,
            ..DetectionConfig::default()
        };
        EnergyEngine::new(&audio, &detection)
    }

    fn next(e: &EnergyEngine) -> FetchResult {
        e.fetch().expect("fetch").expect("queued result")
    }

    #[test]
    fn geometry_follows_config() {
        let e = engine(2);
        assert_eq!(e.feed_channels(), 2);
        assert_eq!(e.feed_chunk_size(), 4);
        assert_eq!(e.fetch_channels(), 1);
        assert_eq!(e.fetch_chunk_size(), 4);
    }

    #[test]
    fn quiet_and_speech_levels_are_classified() {
        let e = engine(1);
        e.feed(&[0, 0, 0, 0]);
        e.feed(&[8_000; 4]);

        let quiet = next(&e);
        assert_eq!(quiet.vad, VadState::Silence);
        assert_eq!(quiet.wake, WakeState::None);

        let speech = next(&e);
        assert_eq!(speech.vad, VadState::Speech);
        assert_eq!(speech.wake, WakeState::None);
    }

    #[test]
    fn loud_onset_verifies_wake_once() {
        let e = engine(1);
        for _ in 0..5 {
            e.feed(&[30_000; 4]);
        }
        let wakes: Vec<WakeState> = (0..5).map(|_| next(&e).wake).collect();
        assert_eq!(
            wakes,
            vec![
                WakeState::None,
                WakeState::None,
                WakeState::Verified,
                WakeState::None,
                WakeState::None
            ]
        );
    }

    #[test]
    fn disabled_wake_word_never_verifies() {
        let e = engine(1);
        e.disable_wake_word();
        for _ in 0..5 {
            e.feed(&[30_000; 4]);
        }
        assert!((0..5).all(|_| next(&e).wake == WakeState::None));

        e.enable_wake_word();
        for _ in 0..3 {
            e.feed(&[30_000; 4]);
        }
        let last = (0..3).map(|_| next(&e).wake).last();
        assert_eq!(last, Some(WakeState::Verified));
    }

    #[test]
    fn stereo_feed_is_downmixed_and_reframed() {
        let e = engine(2);
        // 3 stereo frames, then 3 more: 6 mono samples -> one 4-sample frame.
        e.feed(&[100, 300, 100, 300, 100, 300]);
        e.feed(&[100, 300, 100, 300, 100, 300]);
        let frame = next(&e);
        assert_eq!(frame.pcm, vec![200; 4]);
        assert_eq!(e.fetch().expect("fetch"), None);
    }
}
