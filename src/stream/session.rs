//! Streaming session: binds to a detection session's ring and events and
//! owns the connection lifecycle.
//!
//! # Threads and tasks
//!
//! ```text
//!  analysis thread (event handlers)        controller task (tokio)
//!  ────────────────────────────────        ───────────────────────
//!  detected ─ Control::Detected ────────▶  spawn link / arm idle link
//!  started  ─ ring.drop_except_last(P)
//!           ─ streaming = true
//!           ─ Control::Started ─────────▶  spawn link / arm idle link
//!  silenced ─ streaming = false
//!           ─ Control::Silenced ────────▶  disarm
//!                                          LinkEnded ─▶ reap, maybe retry
//!                                          RetryFired ─▶ reconnect
//! ```
//!
//! Handlers only touch atomics and post messages; every connection decision
//! is taken on the controller task, one message at a time.  At most one link
//! exists at any moment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::audio::FrameRing;
use crate::config::AppConfig;
use crate::events::{SessionEvents, Subscription};

use super::link::{self, LinkContext, LinkOutcome, LinkParams};
use super::transport::Connector;

/// How long shutdown waits for a link to wind down before aborting it.
const LINK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    ConnectedIdle,
    Streaming,
}

/// State shared by the event handlers, the controller and the link.
pub(crate) struct Shared {
    pub streaming: AtomicBool,
    ring: RwLock<Option<Arc<FrameRing>>>,
    state: watch::Sender<StreamState>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        Self {
            streaming: AtomicBool::new(false),
            ring: RwLock::new(None),
            state,
        }
    }

    pub fn ring(&self) -> Option<Arc<FrameRing>> {
        self.ring.read().clone()
    }

    pub fn set_state(&self, next: StreamState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::info!("stream: {prev:?} -> {next:?}");
        }
    }
}

enum Control {
    Detected,
    Started,
    Silenced,
    LinkEnded { id: u64, outcome: LinkOutcome },
    RetryFired,
    Shutdown,
}

// ---------------------------------------------------------------------------
// StreamSession
// ---------------------------------------------------------------------------

pub struct StreamSession {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    preroll: usize,
    bindings: Mutex<Vec<Subscription>>,
    controller: Option<JoinHandle<()>>,
}

impl StreamSession {
    /// Spawn the controller on the current tokio runtime.  With
    /// `stream.keep_open` the first connection is opened right away.
    pub fn start(connector: Arc<dyn Connector>, config: &AppConfig) -> Self {
        let shared = Arc::new(Shared::new());
        let (control, rx) = mpsc::unbounded_channel();

        let params = Arc::new(LinkParams {
            uri: config.stream.uri(),
            device_id: config.device.id.clone(),
            sample_rate: config.audio.sample_rate,
            config: config.stream.clone(),
        });
        log::info!(
            "stream: session for {} ({})",
            params.uri,
            if params.config.keep_open { "persistent" } else { "per utterance" }
        );

        let controller = Controller {
            shared: Arc::clone(&shared),
            connector,
            params,
            control: control.clone(),
            link: None,
            retry: None,
            next_id: 0,
            armed: false,
        };

        Self {
            shared,
            control,
            preroll: config.stream.preroll_frames,
            bindings: Mutex::new(Vec::new()),
            controller: Some(tokio::spawn(controller.run(rx))),
        }
    }

    /// Attach to a detection session's ring and events, dropping any
    /// previous binding first.
    pub fn bind(&self, ring: &Arc<FrameRing>, events: &SessionEvents) {
        let mut bindings = self.bindings.lock();
        bindings.clear();

        *self.shared.ring.write() = Some(Arc::clone(ring));
        if self.shared.streaming.swap(false, Ordering::AcqRel) {
            let _ = self.control.send(Control::Silenced);
        }

        let control = self.control.clone();
        bindings.push(events.detected.subscribe(move || {
            let _ = control.send(Control::Detected);
        }));

        let control = self.control.clone();
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(ring);
        let preroll = self.preroll;
        bindings.push(events.started.subscribe(move || {
            let dropped = source.drop_except_last(preroll);
            if dropped > 0 {
                log::debug!("stream: dropped {dropped} stale frame(s) before speech");
            }
            shared.streaming.store(true, Ordering::Release);
            let _ = control.send(Control::Started);
        }));

        let control = self.control.clone();
        let shared = Arc::clone(&self.shared);
        bindings.push(events.silenced.subscribe(move || {
            shared.streaming.store(false, Ordering::Release);
            let _ = control.send(Control::Silenced);
        }));

        log::info!(
            "stream: bound to ring of {} x {} samples",
            ring.capacity(),
            ring.frame_len()
        );
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Unbind, close the link and wait for the controller to exit.
    pub async fn shutdown(mut self) {
        self.bindings.lock().clear();
        if let Some(controller) = self.controller.take() {
            let _ = self.control.send(Control::Shutdown);
            if let Err(e) = controller.await {
                log::error!("stream: controller task failed: {e}");
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.controller.take().is_some() {
            let _ = self.control.send(Control::Shutdown);
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct LinkHandle {
    id: u64,
    running: Arc<AtomicBool>,
    arm: Arc<Notify>,
    task: JoinHandle<()>,
}

struct Controller {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    params: Arc<LinkParams>,
    control: mpsc::UnboundedSender<Control>,
    link: Option<LinkHandle>,
    retry: Option<JoinHandle<()>>,
    next_id: u64,
    /// A wake word was seen and its utterance has not ended yet.
    armed: bool,
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Control>) {
        if self.params.config.keep_open {
            self.spawn_link(false);
        }

        while let Some(message) = rx.recv().await {
            match message {
                Control::Detected => {
                    self.armed = true;
                    match &self.link {
                        Some(link) => link.arm.notify_one(),
                        None => self.spawn_link(true),
                    }
                }
                Control::Started => {
                    self.armed = true;
                    match &self.link {
                        Some(link) => link.arm.notify_one(),
                        None => self.spawn_link(true),
                    }
                }
                Control::Silenced => self.armed = false,
                Control::LinkEnded { id, outcome } => self.on_link_ended(id, outcome).await,
                Control::RetryFired => self.on_retry(),
                Control::Shutdown => break,
            }
        }

        self.stop().await;
        log::debug!("stream: controller exited");
    }

    fn spawn_link(&mut self, armed: bool) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }

        self.next_id += 1;
        let id = self.next_id;
        let running = Arc::new(AtomicBool::new(true));
        let arm = Arc::new(Notify::new());
        let ctx = LinkContext {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
            params: Arc::clone(&self.params),
            running: Arc::clone(&running),
            arm: Arc::clone(&arm),
        };

        let control = self.control.clone();
        let task = tokio::spawn(async move {
            let outcome = link::run(ctx, armed).await;
            let _ = control.send(Control::LinkEnded { id, outcome });
        });
        self.link = Some(LinkHandle {
            id,
            running,
            arm,
            task,
        });
    }

    async fn on_link_ended(&mut self, id: u64, outcome: LinkOutcome) {
        match &self.link {
            Some(link) if link.id == id => {}
            _ => return,
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = link.task.await {
                log::error!("stream: link task failed: {e}");
            }
        }

        match outcome {
            LinkOutcome::ConnectFailed | LinkOutcome::Lost => self.schedule_retry(),
            // Speech that began while the link was winding down still
            // needs a connection of its own.
            LinkOutcome::Finished | LinkOutcome::Stopped => {
                if self.armed && self.shared.streaming.load(Ordering::Acquire) {
                    log::info!("stream: utterance began while closing, reconnecting");
                    self.spawn_link(true);
                }
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }
        let delay = self.params.config.retry_delay();
        log::info!("stream: reconnecting in {delay:?}");
        let control = self.control.clone();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control.send(Control::RetryFired);
        }));
    }

    fn on_retry(&mut self) {
        self.retry = None;
        if self.link.is_some() {
            return;
        }
        if self.params.config.keep_open || self.armed {
            self.spawn_link(self.armed);
        } else {
            log::debug!("stream: retry skipped, no utterance pending");
        }
    }

    async fn stop(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        let Some(mut link) = self.link.take() else {
            return;
        };

        link.running.store(false, Ordering::Release);
        link.arm.notify_one();
        match tokio::time::timeout(LINK_STOP_TIMEOUT, &mut link.task).await {
            Ok(_) => log::debug!("stream: link stopped"),
            Err(_) => {
                log::warn!("stream: link did not stop within {LINK_STOP_TIMEOUT:?}, aborting");
                link.task.abort();
                self.shared.set_state(StreamState::Disconnected);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
