//! Utterance lifecycle state machine.
//!
//! ```text
//!            wake verified              guard spent + speech
//!   Idle ─────────────────▶ Armed ─────────────────────────▶ Feeding
//!    ▲       (Detected)             (Started)                   │
//!    └──────────────────────────────────────────────────────────┘
//!                  S consecutive silence frames (Silenced)
//! ```
//!
//! The silence run is incremented once per silence frame, so `S` is a count
//! of frames.  Any speech frame while feeding resets the run.

use super::engine::{VadState, WakeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtterancePhase {
    Idle,
    Armed,
    Feeding,
}

/// Edge reported by [`UtteranceTracker::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle -> Armed.
    Detected,
    /// Armed -> Feeding.
    Started,
    /// Feeding -> Idle.
    Silenced,
}

#[derive(Debug, Clone)]
pub struct UtteranceTracker {
    phase: UtterancePhase,
    guard_frames: usize,
    silence_frames: usize,
    drop_guard: usize,
    silence_run: usize,
}

impl UtteranceTracker {
    /// `guard_frames` frames are ignored after the wake word;
    /// `silence_frames` consecutive silence frames end an utterance (at
    /// least one).
    pub fn new(guard_frames: usize, silence_frames: usize) -> Self {
        Self {
            phase: UtterancePhase::Idle,
            guard_frames,
            silence_frames: silence_frames.max(1),
            drop_guard: 0,
            silence_run: 0,
        }
    }

    pub fn phase(&self) -> UtterancePhase {
        self.phase
    }

    /// Feed one frame's classification and report the transition it causes.
    pub fn advance(&mut self, wake: WakeState, vad: VadState) -> Option<Transition> {
        match self.phase {
            UtterancePhase::Idle => {
                if wake != WakeState::Verified {
                    return None;
                }
                self.phase = UtterancePhase::Armed;
                self.drop_guard = self.guard_frames;
                self.silence_run = 0;
                Some(Transition::Detected)
            }

            UtterancePhase::Armed => {
                if self.drop_guard > 0 {
                    self.drop_guard -= 1;
                    return None;
                }
                if vad != VadState::Speech {
                    return None;
                }
                self.phase = UtterancePhase::Feeding;
                self.silence_run = 0;
                Some(Transition::Started)
            }

            UtterancePhase::Feeding => match vad {
                VadState::Speech => {
                    self.silence_run = 0;
                    None
                }
                VadState::Silence => {
                    self.silence_run += 1;
                    if self.silence_run < self.silence_frames {
                        return None;
                    }
                    self.phase = UtterancePhase::Idle;
                    self.silence_run = 0;
                    Some(Transition::Silenced)
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
