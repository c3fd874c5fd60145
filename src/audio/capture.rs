//! Microphone input.
//!
//! [`Microphone`] is the blocking read interface the capture thread pulls
//! from.  [`CpalMicrophone`] implements it on top of the default `cpal`
//! input device: a dedicated `mic-stream` thread owns the cpal stream (which
//! is not `Send` on every platform) and forwards converted PCM16 chunks over
//! an mpsc channel to whoever calls [`Microphone::read`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use thiserror::Error;

use super::resample::{db_to_gain, downmix, resample, to_pcm16};

// ---------------------------------------------------------------------------
// HardwareError
// ---------------------------------------------------------------------------

/// Microphone failures.  All of them are fatal to the detection session.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("microphone delivered no audio for {0:?}")]
    Stalled(Duration),

    #[error("microphone stream closed")]
    Closed,

    #[error("microphone read failed: {0}")]
    Read(String),
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// Blocking source of interleaved PCM16 audio.
pub trait Microphone: Send + Sync {
    /// Fill `buf` completely, blocking until enough audio is available.
    fn read(&self, buf: &mut [i16]) -> Result<(), HardwareError>;
}

const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn Microphone>) {}
};

// ---------------------------------------------------------------------------
// CpalMicrophone
// ---------------------------------------------------------------------------

/// Default input device, converted to mono 16-bit PCM at a fixed rate and
/// replicated across `channels` interleaved channels on read.
pub struct CpalMicrophone {
    rx: Mutex<mpsc::Receiver<Vec<i16>>>,
    pending: Mutex<VecDeque<i16>>,
    channels: usize,
    stall_timeout: Duration,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalMicrophone {
    /// Open the default input device.
    ///
    /// `channels` is the interleaved channel count callers expect from
    /// [`Microphone::read`]; `sample_rate` is the output rate and `gain_db`
    /// an input gain applied before PCM16 conversion.
    pub fn open(channels: usize, sample_rate: u32, gain_db: f32) -> Result<Self, HardwareError> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<i16>>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), HardwareError>>(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let gain = db_to_gain(gain_db);

        let thread = std::thread::Builder::new()
            .name("mic-stream".into())
            .spawn(move || {
                let stream = match build_stream(chunk_tx, sample_rate, gain) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while !stop_thread.load(Ordering::Acquire) {
                    std::thread::park_timeout(Duration::from_millis(100));
                }
                drop(stream);
                log::debug!("mic-stream: input stream released");
            })
            .map_err(|e| HardwareError::Read(format!("failed to spawn mic-stream thread: {e}")))?;

        ready_rx.recv().map_err(|_| HardwareError::Closed)??;

        Ok(Self {
            rx: Mutex::new(chunk_rx),
            pending: Mutex::new(VecDeque::new()),
            channels: channels.max(1),
            stall_timeout: Duration::from_secs(2),
            stop,
            thread: Some(thread),
        })
    }
}

fn build_stream(
    tx: mpsc::Sender<Vec<i16>>,
    target_rate: u32,
    gain: f32,
) -> Result<cpal::Stream, HardwareError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(HardwareError::NoDevice)?;
    let supported = device.default_input_config()?;

    let device_channels = supported.channels();
    let device_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono = downmix(data, device_channels);
            let pcm = to_pcm16(&resample(&mono, device_rate, target_rate), gain);
            // Receiver dropped means the microphone is being closed.
            let _ = tx.send(pcm);
        },
        |err: cpal::StreamError| {
            log::error!("mic-stream: cpal stream error: {err}");
        },
        None,
    )?;
    stream.play()?;

    log::info!(
        "mic-stream: capturing {device_rate} Hz x{device_channels} -> {target_rate} Hz mono"
    );
    Ok(stream)
}

impl Microphone for CpalMicrophone {
    fn read(&self, buf: &mut [i16]) -> Result<(), HardwareError> {
        let frames = buf.len() / self.channels;
        let mut pending = self.pending.lock();

        while pending.len() < frames {
            let chunk = self
                .rx
                .lock()
                .recv_timeout(self.stall_timeout)
                .map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => HardwareError::Stalled(self.stall_timeout),
                    mpsc::RecvTimeoutError::Disconnected => HardwareError::Closed,
                })?;
            pending.extend(chunk);
        }

        for (frame, sample) in buf.chunks_exact_mut(self.channels).zip(pending.drain(..frames)) {
            frame.fill(sample);
        }
        Ok(())
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
