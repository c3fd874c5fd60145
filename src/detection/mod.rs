//! Wake-word / voice-activity detection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      DetectionSession                        │
//! │                                                              │
//! │  capture thread ──feed──▶ DetectionEngine ──fetch──▶ analysis│
//! │                           (trait)                     thread │
//! │                                                        │     │
//! │                     ┌──────────────────┬───────────────┤     │
//! │                     ▼                  ▼               ▼     │
//! │              UtteranceTracker      FrameRing     SessionEvents│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`EnergyEngine`] is a level-based engine for hosts without vendor DSP;
//! real devices plug their own [`DetectionEngine`] in.

pub mod energy;
pub mod engine;
pub mod session;
pub mod utterance;

pub use energy::EnergyEngine;
pub use engine::{DetectionEngine, EngineError, FetchResult, VadState, WakeState};
pub use session::{DetectionSession, FailureSender, SessionError, SessionFailure};
pub use utterance::{Transition, UtterancePhase, UtteranceTracker};
