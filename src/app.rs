//! Device composition root and supervisor.
//!
//! # Startup sequence
//!
//! 1. Start the [`StreamSession`] (and its controller task).
//! 2. Build a [`DetectionSession`] from a fresh engine.
//! 3. Bind the stream session to the detection session's ring and events.
//! 4. Start the capture and analysis threads.
//!
//! # Supervision
//!
//! ```text
//! SessionFailure::Engine   ─▶ tear the session down, rebuild from step 2
//! SessionFailure::Hardware ─▶ tear everything down, return the error
//! shutdown future resolves ─▶ tear everything down, return Ok
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::audio::{HardwareError, Microphone};
use crate::config::AppConfig;
use crate::detection::{DetectionEngine, DetectionSession, EngineError, SessionError, SessionFailure};
use crate::stream::{Connector, StreamSession};

/// Pause before a failed detection session is rebuilt.
const RESTART_DELAY: Duration = Duration::from_millis(200);

/// Builds a fresh engine for every detection session.
pub type EngineFactory =
    Box<dyn Fn() -> Result<Arc<dyn DetectionEngine>, EngineError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("detection session: {0}")]
    Session(#[from] SessionError),

    #[error("detection engine: {0}")]
    Engine(#[from] EngineError),

    #[error("microphone failed: {0}")]
    Hardware(#[from] HardwareError),
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct Device {
    config: AppConfig,
    engines: EngineFactory,
    microphone: Arc<dyn Microphone>,
    stream: StreamSession,
    session: Option<DetectionSession>,
    failures: mpsc::UnboundedReceiver<SessionFailure>,
    restarts: u32,
}

impl Device {
    /// Wire everything up and start listening.  Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: AppConfig,
        engines: EngineFactory,
        microphone: Arc<dyn Microphone>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, DeviceError> {
        let stream = StreamSession::start(connector, &config);
        let (_, failures) = mpsc::unbounded_channel();

        let mut device = Self {
            config,
            engines,
            microphone,
            stream,
            session: None,
            failures,
            restarts: 0,
        };
        device.open_session()?;
        log::info!("device: listening as {}", device.config.device.id);
        Ok(device)
    }

    pub fn stream(&self) -> &StreamSession {
        &self.stream
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn open_session(&mut self) -> Result<(), DeviceError> {
        let engine = (self.engines)()?;
        let mut session =
            DetectionSession::new(engine, Arc::clone(&self.microphone), &self.config.detection)?;

        self.stream.bind(session.ring(), session.events());

        let (tx, rx) = mpsc::unbounded_channel();
        self.failures = rx;
        session.start(tx)?;
        self.session = Some(session);
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let joined = tokio::task::spawn_blocking(move || session.shutdown()).await;
            if let Err(e) = joined {
                log::error!("device: session teardown panicked: {e}");
            }
        }
    }

    /// Supervise until `shutdown` resolves or the microphone fails.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), DeviceError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("device: shutdown requested");
                    break Ok(());
                }
                failure = self.failures.recv() => match failure {
                    Some(SessionFailure::Engine(e)) => {
                        log::warn!("device: engine failed ({e}); rebuilding detection session");
                        self.close_session().await;
                        tokio::time::sleep(RESTART_DELAY).await;
                        if let Err(e) = self.open_session() {
                            break Err(e);
                        }
                        self.restarts += 1;
                    }
                    Some(SessionFailure::Hardware(e)) => {
                        log::error!("device: {e}; giving up");
                        break Err(e.into());
                    }
                    None => {
                        log::error!("device: detection session vanished");
                        break Ok(());
                    }
                }
            }
        };

        self.close_session().await;
        self.stream.shutdown().await;
        log::info!("device: stopped after {} restart(s)", self.restarts);
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
