//! One connection's lifetime, from connect to close.
//!
//! ```text
//! connect (bounded) ─▶ [idle until armed]* ─▶ wait for speech (bounded)
//!        │                                        │ flag set
//!        │ timeout / error                        ▼
//!        ▼                               start JSON ─▶ drain ring ─▶ stop JSON
//!   ConnectFailed                                               │
//!                                          keep_open ◀── linger flush_delay
//! ```
//!
//! While the link waits it keeps servicing the heartbeat and the
//! connection's events, so a dead peer is noticed without any traffic.
//! A link that never runs out of frames services them between batches.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::config::StreamConfig;

use super::heartbeat::{Heartbeat, HeartbeatAction};
use super::protocol::{encode_frame, ControlMessage, StartInfo};
use super::session::{Shared, StreamState};
use super::transport::{Connector, Transport, TransportError, TransportEvent};

/// Granularity of the wait for the streaming flag.
const FLAG_POLL: Duration = Duration::from_millis(1);

/// How a link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// No connection within the connect timeout, or the connect failed.
    ConnectFailed,
    /// Closed on purpose: one-shot utterance done, or no speech arrived.
    Finished,
    /// Send failure, heartbeat expiry or peer close.
    Lost,
    /// The session is shutting down.
    Stopped,
}

/// Fixed per-session parameters.
pub(crate) struct LinkParams {
    pub uri: String,
    pub device_id: String,
    pub sample_rate: u32,
    pub config: StreamConfig,
}

pub(crate) struct LinkContext {
    pub shared: Arc<Shared>,
    pub connector: Arc<dyn Connector>,
    pub params: Arc<LinkParams>,
    pub running: Arc<AtomicBool>,
    /// Notified on every wake word while this link is alive.
    pub arm: Arc<Notify>,
}

/// Connect and serve until the link ends.  `armed` means a wake word is
/// already pending, so the link goes straight to waiting for speech.
pub(crate) async fn run(ctx: LinkContext, armed: bool) -> LinkOutcome {
    let params = Arc::clone(&ctx.params);
    let cfg = &params.config;

    ctx.shared.set_state(StreamState::Connecting);
    let connection = match time::timeout(cfg.connect_timeout(), ctx.connector.connect(&params.uri)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            log::warn!("stream: {e}");
            ctx.shared.set_state(StreamState::Disconnected);
            return LinkOutcome::ConnectFailed;
        }
        Err(_) => {
            log::warn!(
                "stream: no connection to {} within {:?}",
                params.uri,
                cfg.connect_timeout()
            );
            ctx.shared.set_state(StreamState::Disconnected);
            return LinkOutcome::ConnectFailed;
        }
    };
    log::info!("stream: connected to {}", params.uri);
    ctx.shared.set_state(StreamState::ConnectedIdle);

    let period = cfg.heartbeat_interval();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut link = Link {
        ctx: &ctx,
        transport: connection.transport,
        events: connection.events,
        heartbeat: Heartbeat::new(cfg.heartbeat_max_missed),
        ticker,
    };
    let outcome = match link.serve(armed).await {
        Ok(()) => LinkOutcome::Finished,
        Err(outcome) => outcome,
    };
    link.transport.close().await;

    ctx.shared.set_state(StreamState::Disconnected);
    log::info!("stream: link to {} ended: {outcome:?}", params.uri);
    outcome
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

enum Wake {
    Timer,
    Tick,
    Armed,
    Event(Option<TransportEvent>),
}

struct Link<'a> {
    ctx: &'a LinkContext,
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    heartbeat: Heartbeat,
    ticker: Interval,
}

impl Link<'_> {
    async fn serve(&mut self, mut armed: bool) -> Result<(), LinkOutcome> {
        let keep_open = self.ctx.params.config.keep_open;
        loop {
            if !armed {
                if !keep_open {
                    return Ok(());
                }
                self.wait_for_arm().await?;
            }
            armed = false;

            if self.wait_for_speech().await? {
                self.stream_utterance().await?;
            } else {
                log::info!(
                    "stream: no speech within {:?}, nothing sent",
                    self.ctx.params.config.start_timeout()
                );
            }

            if !keep_open {
                return Ok(());
            }
        }
    }

    fn check_running(&self) -> Result<(), LinkOutcome> {
        if self.ctx.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LinkOutcome::Stopped)
        }
    }

    fn send_timeout(&self) -> Duration {
        self.ctx.params.config.send_timeout()
    }

    // ---- waiting -------------------------------------------------------

    async fn wait_for_arm(&mut self) -> Result<(), LinkOutcome> {
        let arm = Arc::clone(&self.ctx.arm);
        loop {
            self.check_running()?;
            if self.ctx.shared.streaming.load(Ordering::Acquire) {
                return Ok(());
            }
            let wake = tokio::select! {
                _ = arm.notified() => Wake::Armed,
                _ = self.ticker.tick() => Wake::Tick,
                event = self.events.recv() => Wake::Event(event),
            };
            if matches!(wake, Wake::Armed) {
                return Ok(());
            }
            self.handle(wake).await?;
        }
    }

    /// `true` once the streaming flag is set, `false` if the start timeout
    /// passes first.
    async fn wait_for_speech(&mut self) -> Result<bool, LinkOutcome> {
        let deadline = Instant::now() + self.ctx.params.config.start_timeout();
        loop {
            self.check_running()?;
            if self.ctx.shared.streaming.load(Ordering::Acquire) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.service(FLAG_POLL).await?;
        }
    }

    async fn linger(&mut self, total: Duration) -> Result<(), LinkOutcome> {
        let deadline = Instant::now() + total;
        loop {
            self.check_running()?;
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            self.service(left).await?;
        }
    }

    /// Sleep for up to `pause`, handling heartbeat ticks and connection
    /// events that arrive meanwhile.
    async fn service(&mut self, pause: Duration) -> Result<(), LinkOutcome> {
        let wake = tokio::select! {
            _ = time::sleep(pause) => Wake::Timer,
            _ = self.ticker.tick() => Wake::Tick,
            event = self.events.recv() => Wake::Event(event),
        };
        self.handle(wake).await
    }

    /// Handle whatever is already due without waiting: queued connection
    /// events and at most one heartbeat tick.
    async fn service_pending(&mut self) -> Result<(), LinkOutcome> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.handle(Wake::Event(Some(event))).await?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return self.handle(Wake::Event(None)).await,
            }
        }
        if self.ticker.tick().now_or_never().is_some() {
            self.handle(Wake::Tick).await?;
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), LinkOutcome> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            log::warn!("stream: transport reports the connection closed");
            Err(LinkOutcome::Lost)
        }
    }

    async fn handle(&mut self, wake: Wake) -> Result<(), LinkOutcome> {
        match wake {
            Wake::Timer | Wake::Armed => Ok(()),
            Wake::Tick => match self.heartbeat.on_tick() {
                HeartbeatAction::Ping => {
                    let limit = self.send_timeout();
                    bounded(limit, self.transport.ping()).await.map_err(lost)
                }
                HeartbeatAction::Expired => {
                    log::warn!(
                        "stream: {} heartbeat(s) unanswered, dropping connection",
                        self.heartbeat.missed()
                    );
                    Err(LinkOutcome::Lost)
                }
            },
            Wake::Event(Some(TransportEvent::Pong)) => {
                self.heartbeat.on_pong();
                Ok(())
            }
            Wake::Event(Some(TransportEvent::Disconnected)) | Wake::Event(None) => {
                log::warn!("stream: peer closed the connection");
                Err(LinkOutcome::Lost)
            }
        }
    }

    // ---- streaming -----------------------------------------------------

    async fn stream_utterance(&mut self) -> Result<(), LinkOutcome> {
        let ctx = self.ctx;
        let cfg = &ctx.params.config;
        let limit = self.send_timeout();

        let Some(ring) = ctx.shared.ring() else {
            log::warn!("stream: speech flagged but no frame source is bound");
            return Ok(());
        };

        let start = ControlMessage::Start(StartInfo::pcm16_mono(
            &ctx.params.device_id,
            ctx.params.sample_rate,
            ring.frame_len(),
            cfg.gain,
        ));
        let text = start.to_json().map_err(|e| lost(e.into()))?;
        self.ensure_connected()?;
        bounded(limit, self.transport.send_text(text)).await.map_err(lost)?;
        ctx.shared.set_state(StreamState::Streaming);
        log::info!("stream: utterance started");

        let mut frame = vec![0_i16; ring.frame_len()];
        let mut sent: u64 = 0;

        while ctx.shared.streaming.load(Ordering::Acquire) {
            self.check_running()?;
            self.ensure_connected()?;

            if self.transport.in_flight_bytes() > cfg.soft_backlog_bytes {
                bounded(limit, self.transport.flush()).await.map_err(lost)?;
                if self.transport.in_flight_bytes() > cfg.soft_backlog_bytes {
                    self.service(cfg.idle_backoff()).await?;
                    continue;
                }
            }

            let mut batch = 0;
            while batch < ring.capacity()
                && self.transport.in_flight_bytes() <= cfg.soft_backlog_bytes
                && ring.pop_nowait(&mut frame)
            {
                bounded(limit, self.transport.send_binary(encode_frame(&frame)))
                    .await
                    .map_err(lost)?;
                batch += 1;
            }

            if batch > 0 {
                sent += batch as u64;
                bounded(limit, self.transport.flush()).await.map_err(lost)?;
                self.service_pending().await?;
            } else {
                self.service(cfg.idle_backoff()).await?;
            }
        }

        let text = ControlMessage::Stop.to_json().map_err(|e| lost(e.into()))?;
        bounded(limit, self.transport.send_text(text)).await.map_err(lost)?;
        log::info!("stream: utterance ended after {sent} frame(s)");

        self.linger(cfg.flush_delay()).await?;
        ctx.shared.set_state(StreamState::ConnectedIdle);
        Ok(())
    }
}

async fn bounded<F>(limit: Duration, op: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    time::timeout(limit, op)
        .await
        .unwrap_or(Err(TransportError::SendTimeout(limit)))
}

fn lost(e: TransportError) -> LinkOutcome {
    log::warn!("stream: connection lost: {e}");
    LinkOutcome::Lost
}
