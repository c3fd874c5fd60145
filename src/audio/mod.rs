//! Audio plumbing: microphone input, format conversion and the frame ring.
//!
//! ```text
//! cpal callback ─▶ downmix ─▶ resample ─▶ to_pcm16 ─▶ CpalMicrophone::read
//!
//! analysis thread ─▶ FrameRing::push ··· FrameRing::pop_nowait ◀─ stream link
//! ```

pub mod capture;
pub mod resample;
pub mod ring;

pub use capture::{CpalMicrophone, HardwareError, Microphone};
pub use resample::{db_to_gain, downmix, resample, rms, to_pcm16};
pub use ring::{FrameRing, RingStats};
