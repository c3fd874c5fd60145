//! Scripted doubles for the engine, the microphone and the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::audio::{HardwareError, Microphone};
use crate::detection::engine::{DetectionEngine, EngineError, FetchResult, VadState, WakeState};
use crate::stream::transport::{Connection, Connector, Transport, TransportError, TransportEvent};

// ---------------------------------------------------------------------------
// ScriptedEngine
// ---------------------------------------------------------------------------

pub enum Step {
    /// A frame whose samples all equal its position in the script.
    Frame { wake: WakeState, vad: VadState },
    Raw(FetchResult),
    Fail(String),
}

impl Step {
    pub fn frame(wake: WakeState, vad: VadState) -> Self {
        Step::Frame { wake, vad }
    }
}

/// Replays a fixed list of fetch results, one per `pace`, then idles.
pub struct ScriptedEngine {
    chunk: usize,
    channels: usize,
    pace: Duration,
    script: Mutex<VecDeque<Step>>,
    position: AtomicUsize,
    fed: AtomicUsize,
    toggles: Mutex<Vec<bool>>,
}

impl ScriptedEngine {
    pub fn new(chunk: usize, channels: usize, script: Vec<Step>) -> Self {
        Self {
            chunk,
            channels,
            pace: Duration::from_millis(1),
            script: Mutex::new(script.into()),
            position: AtomicUsize::new(0),
            fed: AtomicUsize::new(0),
            toggles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// `false` for every disable call, `true` for every enable call.
    pub fn wake_toggles(&self) -> Vec<bool> {
        self.toggles.lock().clone()
    }

    pub fn fed_blocks(&self) -> usize {
        self.fed.load(Ordering::SeqCst)
    }
}

impl DetectionEngine for ScriptedEngine {
    fn feed(&self, _block: &[i16]) {
        self.fed.fetch_add(1, Ordering::SeqCst);
    }

    fn fetch(&self) -> Result<Option<FetchResult>, EngineError> {
        std::thread::sleep(self.pace);
        let next = self.script.lock().pop_front();
        let Some(step) = next else {
            std::thread::sleep(Duration::from_millis(5));
            return Ok(None);
        };
        let index = self.position.fetch_add(1, Ordering::SeqCst);
        match step {
            Step::Frame { wake, vad } => Ok(Some(FetchResult {
                wake,
                vad,
                pcm: vec![index as i16; self.chunk * self.channels],
            })),
            Step::Raw(result) => Ok(Some(result)),
            Step::Fail(reason) => Err(EngineError::Fetch(reason)),
        }
    }

    fn enable_wake_word(&self) {
        self.toggles.lock().push(true);
    }

    fn disable_wake_word(&self) {
        self.toggles.lock().push(false);
    }

    fn feed_channels(&self) -> usize {
        self.channels
    }

    fn feed_chunk_size(&self) -> usize {
        self.chunk
    }

    fn fetch_channels(&self) -> usize {
        self.channels
    }

    fn fetch_chunk_size(&self) -> usize {
        self.chunk
    }
}

// ---------------------------------------------------------------------------
// ScriptedMicrophone
// ---------------------------------------------------------------------------

pub struct ScriptedMicrophone {
    fail_after: Option<usize>,
    reads: AtomicUsize,
}

impl ScriptedMicrophone {
    /// Zeros, one block per millisecond, forever.
    pub fn silent() -> Self {
        Self {
            fail_after: None,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(reads: usize) -> Self {
        Self {
            fail_after: Some(reads),
            reads: AtomicUsize::new(0),
        }
    }
}

impl Microphone for ScriptedMicrophone {
    fn read(&self, buf: &mut [i16]) -> Result<(), HardwareError> {
        let done = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| done >= limit) {
            return Err(HardwareError::Read("scripted fault".into()));
        }
        std::thread::sleep(Duration::from_millis(1));
        buf.fill(0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockConnector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(String),
    Binary(Vec<u8>),
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse,
    /// Never completes; the caller's timeout has to fire.
    Stall,
}

/// Records everything sent over any connection it opened.
pub struct MockConnector {
    mode: Mutex<ConnectMode>,
    answer_pings: bool,
    fail_binary_after: Option<usize>,
    send_delay: Duration,
    attempts: AtomicUsize,
    wire: Arc<Mutex<Vec<Sent>>>,
    flushes: Arc<AtomicUsize>,
    peer: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    alive: Mutex<Option<Arc<AtomicBool>>>,
}

impl MockConnector {
    fn with_mode(mode: ConnectMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            answer_pings: true,
            fail_binary_after: None,
            send_delay: Duration::ZERO,
            attempts: AtomicUsize::new(0),
            wire: Arc::new(Mutex::new(Vec::new())),
            flushes: Arc::new(AtomicUsize::new(0)),
            peer: Mutex::new(None),
            alive: Mutex::new(None),
        }
    }

    pub fn accepting() -> Self {
        Self::with_mode(ConnectMode::Accept)
    }

    pub fn stalling() -> Self {
        Self::with_mode(ConnectMode::Stall)
    }

    pub fn refusing() -> Self {
        Self::with_mode(ConnectMode::Refuse)
    }

    pub fn answering_pings(mut self, answer: bool) -> Self {
        self.answer_pings = answer;
        self
    }

    /// Each connection accepts `n` binary messages and fails the next.
    pub fn failing_binary_after(mut self, n: usize) -> Self {
        self.fail_binary_after = Some(n);
        self
    }

    /// Every binary send takes `delay` before it completes.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock() = mode;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.wire.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.wire
            .lock()
            .iter()
            .filter_map(|m| match m {
                Sent::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn binaries(&self) -> Vec<Vec<u8>> {
        self.wire
            .lock()
            .iter()
            .filter_map(|m| match m {
                Sent::Binary(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.wire.lock().iter().filter(|m| **m == Sent::Ping).count()
    }

    /// Simulate the peer going away on the latest connection.
    pub fn drop_connection(&self) {
        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.send(TransportEvent::Disconnected);
        }
    }

    /// Mark the latest connection closed without telling the link.
    pub fn sever(&self) {
        if let Some(alive) = self.alive.lock().take() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, uri: &str) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            ConnectMode::Accept => {}
            ConnectMode::Refuse => {
                return Err(TransportError::Connect {
                    uri: uri.into(),
                    reason: "refused".into(),
                })
            }
            ConnectMode::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(TransportError::Closed);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        *self.peer.lock() = Some(tx.clone());
        *self.alive.lock() = Some(Arc::clone(&alive));
        Ok(Connection {
            transport: Box::new(MockTransport {
                wire: Arc::clone(&self.wire),
                flushes: Arc::clone(&self.flushes),
                answer_pings: self.answer_pings,
                fail_binary_after: self.fail_binary_after,
                send_delay: self.send_delay,
                binaries: 0,
                in_flight: 0,
                connected: alive,
                peer: tx,
            }),
            events: rx,
        })
    }
}

struct MockTransport {
    wire: Arc<Mutex<Vec<Sent>>>,
    flushes: Arc<AtomicUsize>,
    answer_pings: bool,
    fail_binary_after: Option<usize>,
    send_delay: Duration,
    binaries: usize,
    in_flight: usize,
    connected: Arc<AtomicBool>,
    peer: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.wire.lock().push(Sent::Text(text));
        Ok(())
    }

    async fn send_binary(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if self.fail_binary_after.is_some_and(|n| self.binaries >= n) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Send("scripted send failure".into()));
        }
        self.binaries += 1;
        self.in_flight += payload.len();
        self.wire.lock().push(Sent::Binary(payload));
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.wire.lock().push(Sent::Ping);
        if self.answer_pings {
            let _ = self.peer.send(TransportEvent::Pong);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.in_flight = 0;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn in_flight_bytes(&self) -> usize {
        self.in_flight
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
