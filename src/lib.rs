//! wake-stream: voice-activated streaming core.
//!
//! ```text
//! Microphone ─▶ capture thread ─▶ DetectionEngine ─▶ analysis thread
//!                                                        │
//!                                     ┌──────────────────┼──────────────┐
//!                                     ▼                  ▼              ▼
//!                              UtteranceTracker      FrameRing     SessionEvents
//!                                                        │              │
//!                                                        ▼              ▼
//!                                              link task ◀── StreamSession controller
//!                                                  │
//!                                                  ▼
//!                                              Transport (WebSocket)
//! ```

pub mod app;
pub mod audio;
pub mod config;
pub mod detection;
pub mod events;
pub mod stream;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
