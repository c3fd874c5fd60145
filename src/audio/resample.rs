//! Sample-format helpers between the cpal callback and the detection engine.
//!
//! cpal hands us interleaved `f32` at whatever rate the device prefers; the
//! engine wants 16 kHz `i16` blocks.  The conversion runs in three steps:
//!
//! 1. [`downmix`] interleaved channels to mono.
//! 2. [`resample`] to the target rate (linear interpolation).
//! 3. [`to_pcm16`] with an input gain applied.
//!
//! [`rms`] is shared with the energy engine, which measures levels on the
//! PCM16 frames it hands back.

// ---------------------------------------------------------------------------
// downmix
// ---------------------------------------------------------------------------

/// Average interleaved channels down to mono.
///
/// Output length is `samples.len() / channels`; a trailing partial frame is
/// ignored.  `channels == 0` yields an empty vector.
///
/// ```rust
/// use wake_stream::audio::downmix;
///
/// let stereo = [0.5_f32, -0.5, 0.25, 0.75];
/// assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);
/// ```
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// resample
// ---------------------------------------------------------------------------

/// Resample mono `samples` from `from_rate` to `to_rate` Hz with linear
/// interpolation.
///
/// Equal rates return a copy.  Output length is
/// `ceil(samples.len() * to_rate / from_rate)`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let idx = src_pos as usize;
            let frac = (src_pos - idx as f64) as f32;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
                (Some(&a), None) => a,
                _ => 0.0,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// PCM16 conversion
// ---------------------------------------------------------------------------

/// Convert a gain in decibels to a linear factor.
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Scale `samples` by `gain` and convert to saturating signed 16-bit PCM.
pub fn to_pcm16(samples: &[f32], gain: f32) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * gain * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Root-mean-square level of a PCM16 block, normalised to `[0.0, 1.0]`.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq = samples
        .iter()
        .map(|&s| {
            let v = s as f32 / i16::MAX as f32;
            v * v
        })
        .sum::<f32>()
        / samples.len() as f32;
    mean_sq.sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
