//! Detection session: capture thread, analysis thread, frame ring.
//!
//! ```text
//!  capture thread                      analysis thread
//!  ──────────────                      ───────────────
//!  mic.read(block)                     engine.fetch()
//!  engine.feed(block)   ── engine ──▶    ├─ ring.push(pcm)        (always)
//!                                        ├─ tracker.advance(wake, vad)
//!                                        └─ events.{detected,started,silenced}.emit()
//! ```
//!
//! Engine and microphone failures end the affected thread and are reported
//! once on the failure channel.  The session is not restarted from within;
//! whoever owns it builds a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::{FrameRing, HardwareError, Microphone};
use crate::config::DetectionConfig;
use crate::events::SessionEvents;
use crate::worker::{ShutdownPolicy, Worker};

use super::engine::{DetectionEngine, EngineError};
use super::utterance::{Transition, UtteranceTracker};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("session already started")]
    AlreadyStarted,
}

/// Fatal condition reported by a running session.
#[derive(Debug, Error)]
pub enum SessionFailure {
    #[error("detection engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("microphone failed: {0}")]
    Hardware(#[from] HardwareError),
}

pub type FailureSender = mpsc::UnboundedSender<SessionFailure>;

// ---------------------------------------------------------------------------
// DetectionSession
// ---------------------------------------------------------------------------

pub struct DetectionSession {
    engine: Arc<dyn DetectionEngine>,
    microphone: Arc<dyn Microphone>,
    ring: Arc<FrameRing>,
    events: Arc<SessionEvents>,
    config: DetectionConfig,
    capture: Option<Worker>,
    analysis: Option<Worker>,
}

impl DetectionSession {
    /// Size the ring from the engine geometry.  No thread runs until
    /// [`start`](Self::start), so listeners can subscribe to
    /// [`events`](Self::events) first.
    pub fn new(
        engine: Arc<dyn DetectionEngine>,
        microphone: Arc<dyn Microphone>,
        config: &DetectionConfig,
    ) -> Result<Self, SessionError> {
        let frame_len = engine.fetch_chunk_size() * engine.fetch_channels();
        if frame_len == 0 {
            return Err(EngineError::Geometry("fetch").into());
        }
        if engine.feed_chunk_size() * engine.feed_channels() == 0 {
            return Err(EngineError::Geometry("feed").into());
        }

        let ring = Arc::new(FrameRing::new(
            config.ring_capacity.max(1),
            frame_len,
            config.drop_rate_alpha,
        ));
        log::info!(
            "detection: ring of {} frames x {} samples",
            ring.capacity(),
            frame_len
        );

        Ok(Self {
            engine,
            microphone,
            ring,
            events: Arc::new(SessionEvents::new()),
            config: config.clone(),
            capture: None,
            analysis: None,
        })
    }

    pub fn ring(&self) -> &Arc<FrameRing> {
        &self.ring
    }

    pub fn events(&self) -> &Arc<SessionEvents> {
        &self.events
    }

    /// Spawn the capture and analysis threads.
    pub fn start(&mut self, failures: FailureSender) -> Result<(), SessionError> {
        if self.capture.is_some() || self.analysis.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        let policy = ShutdownPolicy {
            timeout: self.config.shutdown_timeout(),
            poll: self.config.shutdown_poll(),
        };

        let analysis = {
            let engine = Arc::clone(&self.engine);
            let ring = Arc::clone(&self.ring);
            let events = Arc::clone(&self.events);
            let tracker = UtteranceTracker::new(
                self.config.drop_guard_frames,
                self.config.silence_frames_to_idle,
            );
            let stats_every = self.config.stats_every_frames;
            let failures = failures.clone();
            Worker::spawn("analysis", policy, move |running| {
                run_analysis(&running, &*engine, &ring, &events, tracker, stats_every, &failures)
            })
            .map_err(|source| SessionError::Spawn {
                name: "analysis",
                source,
            })?
        };
        self.analysis = Some(analysis);

        let capture = {
            let engine = Arc::clone(&self.engine);
            let microphone = Arc::clone(&self.microphone);
            Worker::spawn("capture", policy, move |running| {
                run_capture(&running, &*engine, &*microphone, &failures)
            })
            .map_err(|source| SessionError::Spawn {
                name: "capture",
                source,
            })?
        };
        self.capture = Some(capture);

        log::info!("detection: session started");
        Ok(())
    }

    /// Stop both threads, capture first.  Idempotent.
    pub fn shutdown(&mut self) {
        for mut worker in [self.capture.take(), self.analysis.take()].into_iter().flatten() {
            let outcome = worker.stop();
            log::debug!("detection: {} thread {:?}", worker.name(), outcome);
        }
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

fn run_capture(
    running: &AtomicBool,
    engine: &dyn DetectionEngine,
    microphone: &dyn Microphone,
    failures: &FailureSender,
) {
    let mut block = vec![0_i16; engine.feed_chunk_size() * engine.feed_channels()];

    while running.load(Ordering::Acquire) {
        if let Err(e) = microphone.read(&mut block) {
            log::error!("detection: microphone read failed: {e}");
            let _ = failures.send(e.into());
            return;
        }
        engine.feed(&block);
    }
    log::debug!("detection: capture loop exited");
}

fn run_analysis(
    running: &AtomicBool,
    engine: &dyn DetectionEngine,
    ring: &FrameRing,
    events: &SessionEvents,
    mut tracker: UtteranceTracker,
    stats_every: u64,
    failures: &FailureSender,
) {
    let frame_len = ring.frame_len();
    let mut frames: u64 = 0;

    while running.load(Ordering::Acquire) {
        let result = match engine.fetch() {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => {
                log::error!("detection: {e}; analysis loop stopping");
                let _ = failures.send(e.into());
                return;
            }
        };

        if result.pcm.len() != frame_len {
            let e = EngineError::FrameSize {
                expected: frame_len,
                actual: result.pcm.len(),
            };
            log::error!("detection: {e}; analysis loop stopping");
            let _ = failures.send(e.into());
            return;
        }

        ring.push(&result.pcm);
        frames += 1;
        if stats_every > 0 && frames % stats_every == 0 {
            log::debug!("detection: ring {}", ring.stats());
        }

        match tracker.advance(result.wake, result.vad) {
            Some(Transition::Detected) => {
                engine.disable_wake_word();
                log::info!("detection: wake word verified");
                events.detected.emit();
            }
            Some(Transition::Started) => {
                log::info!("detection: speech started");
                events.started.emit();
            }
            Some(Transition::Silenced) => {
                engine.enable_wake_word();
                log::info!("detection: speech ended");
                events.silenced.emit();
            }
            None => {}
        }
    }
    log::debug!("detection: analysis loop exited after {frames} frames");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::engine::{VadState, WakeState};
    use crate::testing::{ScriptedEngine, ScriptedMicrophone, Step};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn config() -> DetectionConfig {
        DetectionConfig {
            ring_capacity: 8,
            drop_guard_frames: 3,
            silence_frames_to_idle: 4,
            shutdown_timeout_ms: 500,
            shutdown_poll_ms: 5,
            ..DetectionConfig::default()
        }
    }

    fn wait_for(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    fn count(event: &crate::events::Event) -> (Arc<AtomicUsize>, crate::events::Subscription) {
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&hits);
        let sub = event.subscribe(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (hits, sub)
    }

    #[test]
    fn ring_is_sized_from_fetch_geometry() {
        let engine = Arc::new(ScriptedEngine::new(4, 2, Vec::new()));
        let session =
            DetectionSession::new(engine, Arc::new(ScriptedMicrophone::silent()), &config())
                .expect("session");
        assert_eq!(session.ring().frame_len(), 8);
        assert_eq!(session.ring().capacity(), 8);
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let engine = Arc::new(ScriptedEngine::new(0, 1, Vec::new()));
        let result = DetectionSession::new(engine, Arc::new(ScriptedMicrophone::silent()), &config());
        assert!(matches!(
            result,
            Err(SessionError::Engine(EngineError::Geometry("fetch")))
        ));
    }

    #[test]
    fn full_utterance_emits_each_event_once_and_toggles_wake_word() {
        let mut script = vec![Step::frame(WakeState::Verified, VadState::Silence)];
        script.extend((0..3).map(|_| Step::frame(WakeState::None, VadState::Speech)));
        script.extend((0..5).map(|_| Step::frame(WakeState::None, VadState::Speech)));
        script.extend((0..4).map(|_| Step::frame(WakeState::None, VadState::Silence)));
        let engine = Arc::new(ScriptedEngine::new(4, 1, script));

        let mut session = DetectionSession::new(
            Arc::clone(&engine) as Arc<dyn DetectionEngine>,
            Arc::new(ScriptedMicrophone::silent()),
            &config(),
        )
        .expect("session");

        let (detected, _d) = count(&session.events().detected);
        let (started, _s) = count(&session.events().started);
        let (silenced, _x) = count(&session.events().silenced);

        let (tx, _rx) = mpsc::unbounded_channel();
        session.start(tx).expect("start");

        assert!(wait_for(Duration::from_secs(2), || silenced.load(Ordering::SeqCst) == 1));
        session.shutdown();

        assert_eq!(detected.load(Ordering::SeqCst), 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(engine.wake_toggles(), vec![false, true]);
        assert_eq!(session.ring().stats().produced, 13);
        assert!(engine.fed_blocks() > 0);
    }

    #[test]
    fn engine_failure_is_reported_and_stops_analysis() {
        let script = vec![
            Step::frame(WakeState::None, VadState::Silence),
            Step::Fail("dsp fault".into()),
            Step::frame(WakeState::Verified, VadState::Speech),
        ];
        let engine = Arc::new(ScriptedEngine::new(2, 1, script));
        let mut session = DetectionSession::new(
            engine,
            Arc::new(ScriptedMicrophone::silent()),
            &config(),
        )
        .expect("session");
        let (detected, _d) = count(&session.events().detected);

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(tx).expect("start");

        assert!(wait_for(Duration::from_secs(2), || !rx.is_empty()));
        assert!(matches!(rx.try_recv(), Ok(SessionFailure::Engine(EngineError::Fetch(_)))));
        session.shutdown();
        assert_eq!(detected.load(Ordering::SeqCst), 0);
        assert_eq!(session.ring().stats().produced, 1);
    }

    #[test]
    fn wrong_frame_size_is_fatal() {
        let script = vec![Step::Raw(crate::detection::engine::FetchResult {
            wake: WakeState::None,
            vad: VadState::Silence,
            pcm: vec![0; 3],
        })];
        let engine = Arc::new(ScriptedEngine::new(2, 1, script));
        let mut session = DetectionSession::new(
            engine,
            Arc::new(ScriptedMicrophone::silent()),
            &config(),
        )
        .expect("session");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(tx).expect("start");
        assert!(wait_for(Duration::from_secs(2), || !rx.is_empty()));
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionFailure::Engine(EngineError::FrameSize { expected: 2, actual: 3 }))
        ));
        assert_eq!(session.ring().stats().produced, 0);
    }

    #[test]
    fn microphone_failure_is_reported() {
        let engine = Arc::new(ScriptedEngine::new(2, 1, Vec::new()));
        let mut session = DetectionSession::new(
            engine,
            Arc::new(ScriptedMicrophone::failing_after(3)),
            &config(),
        )
        .expect("session");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.start(tx).expect("start");
        assert!(wait_for(Duration::from_secs(2), || !rx.is_empty()));
        assert!(matches!(rx.try_recv(), Ok(SessionFailure::Hardware(_))));
    }

    #[test]
    fn start_twice_is_rejected() {
        let engine = Arc::new(ScriptedEngine::new(2, 1, Vec::new()));
        let mut session =
            DetectionSession::new(engine, Arc::new(ScriptedMicrophone::silent()), &config())
                .expect("session");
        let (tx, _rx) = mpsc::unbounded_channel();
        session.start(tx.clone()).expect("start");
        assert!(matches!(session.start(tx), Err(SessionError::AlreadyStarted)));
    }
}
