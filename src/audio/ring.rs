//! Lossy single-producer / single-consumer ring of fixed-size PCM frames.
//!
//! [`FrameRing`] sits between the analysis thread (producer) and the
//! streaming link (consumer).  The producer never blocks: when the consumer
//! falls behind, the oldest unread frames are overwritten and accounted as
//! overruns the next time the consumer looks at the ring.
//!
//! # Sequence counters
//!
//! ```text
//!            tail                      head
//!             │                         │
//!   ... ──────▼─────────────────────────▼──────▶  monotonically increasing
//!             └──── min(head - tail, C) ┘
//!
//!   slot index = sequence % C
//! ```
//!
//! # Ordering contract
//!
//! * `head` is written only by the producer with `Release` and read by the
//!   consumer with `Acquire`, so a popped frame is always the one that was
//!   pushed under that sequence.
//! * Before touching a slot the producer publishes the sequence it is about
//!   to write in `claimed`.  The consumer re-reads `claimed` after copying a
//!   frame; if the producer has lapped it the copy is discarded and the
//!   consumer fast-forwards instead of handing out a torn frame.
//! * `tail` only moves forward, through CAS or `fetch_max`, so the consumer and
//!   a concurrent [`FrameRing::drop_except_last`] can never move it back or
//!   hand out the same frame twice.
//!
//! # Example
//!
//! ```rust
//! use wake_stream::audio::FrameRing;
//!
//! let ring = FrameRing::new(4, 2, 0.05);
//! for n in 0..6_i16 {
//!     ring.push(&[n, n]);
//! }
//! assert_eq!(ring.size(), 4);
//!
//! let mut frame = [0_i16; 2];
//! assert!(ring.pop_nowait(&mut frame));
//! assert_eq!(frame, [2, 2]); // frames 0 and 1 were overwritten
//! assert_eq!(ring.stats().overruns, 2);
//! ```

use std::fmt;
use std::sync::atomic::{fence, AtomicI16, AtomicU32, AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// RingStats
// ---------------------------------------------------------------------------

/// Point-in-time counters of a [`FrameRing`].  Observability only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingStats {
    pub produced: usize,
    pub consumed: usize,
    pub overruns: usize,
    pub capacity: usize,
    pub size: usize,
    /// Smoothed fraction of pushes that overran the consumer, in `[0, 1]`.
    pub drop_rate: f32,
}

impl fmt::Display for RingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "produced={} consumed={} overruns={} size={}/{} drop_rate={:.3}",
            self.produced, self.consumed, self.overruns, self.size, self.capacity, self.drop_rate
        )
    }
}

// ---------------------------------------------------------------------------
// FrameRing
// ---------------------------------------------------------------------------

/// Fixed-capacity circular buffer of `capacity` frames of `frame_len` samples.
pub struct FrameRing {
    slots: Box<[AtomicI16]>,
    capacity: usize,
    frame_len: usize,
    /// Next sequence to write.
    head: AtomicUsize,
    /// Next sequence to read.
    tail: AtomicUsize,
    /// One past the sequence the producer is currently writing.
    claimed: AtomicUsize,
    produced: AtomicUsize,
    consumed: AtomicUsize,
    overruns: AtomicUsize,
    /// `f32` bits of the drop-rate EMA.
    drop_rate: AtomicU32,
    alpha: f32,
}

impl FrameRing {
    /// Create a ring holding `capacity` frames of `frame_len` samples each.
    ///
    /// `alpha` is the smoothing factor of the drop-rate EMA (`0.05` keeps
    /// roughly the last twenty pushes in view).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `frame_len` is zero.
    pub fn new(capacity: usize, frame_len: usize, alpha: f32) -> Self {
        assert!(capacity > 0, "FrameRing capacity must be > 0");
        assert!(frame_len > 0, "FrameRing frame_len must be > 0");

        let slots = (0..capacity * frame_len)
            .map(|_| AtomicI16::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            capacity,
            frame_len,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            produced: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            overruns: AtomicUsize::new(0),
            drop_rate: AtomicU32::new(0.0_f32.to_bits()),
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Number of frame slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Copy one frame into the slot at `head` and advance `head`.
    ///
    /// Never blocks.  A `frame` shorter than [`frame_len`](Self::frame_len) is
    /// zero-padded and a longer one is truncated.  Must only be called from
    /// the single producer thread.
    pub fn push(&self, frame: &[i16]) {
        let head = self.head.load(Ordering::Relaxed);

        self.claimed.store(head + 1, Ordering::Relaxed);
        fence(Ordering::Release);

        let base = (head % self.capacity) * self.frame_len;
        let slot = &self.slots[base..base + self.frame_len];
        for (i, cell) in slot.iter().enumerate() {
            cell.store(frame.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }

        self.head.store(head + 1, Ordering::Release);
        self.produced.fetch_add(1, Ordering::Relaxed);

        let tail = self.tail.load(Ordering::Acquire);
        if head + 1 - tail > self.capacity {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            self.blend_drop_rate(1.0);
        } else {
            self.blend_drop_rate(0.0);
        }
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    /// Copy the oldest unread frame into `out` and advance `tail`.
    ///
    /// Returns `false` when the ring is empty.  Only the first
    /// `min(out.len(), frame_len)` samples of `out` are written.
    pub fn pop_nowait(&self, out: &mut [i16]) -> bool {
        let n = out.len().min(self.frame_len);

        loop {
            self.fast_forward();

            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if tail >= head {
                return false;
            }

            let base = (tail % self.capacity) * self.frame_len;
            for (dst, cell) in out[..n].iter_mut().zip(&self.slots[base..base + n]) {
                *dst = cell.load(Ordering::Relaxed);
            }

            fence(Ordering::Acquire);
            let claimed = self.claimed.load(Ordering::Relaxed);
            if claimed > tail + self.capacity {
                // Lapped while copying; the slot now belongs to a newer frame.
                self.tail
                    .fetch_max(claimed - self.capacity, Ordering::AcqRel);
                continue;
            }

            if self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
    }

    /// Discard all but the newest `n` unread frames.
    ///
    /// A no-op when at most `n` frames are buffered.  Skipped frames count
    /// as overruns.  Returns the number of frames dropped.
    pub fn drop_except_last(&self, n: usize) -> usize {
        self.fast_forward();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            let keep = n.min(head.saturating_sub(tail));
            let new_tail = head - keep;
            if new_tail <= tail {
                return 0;
            }

            if self
                .tail
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let dropped = new_tail - tail;
                self.overruns.fetch_add(dropped, Ordering::Relaxed);
                self.blend_drop_rate(dropped as f32 / (dropped as f32 + 1.0));
                return dropped;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Number of unread frames, always in `[0, capacity]`.
    pub fn size(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            produced: self.produced.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            capacity: self.capacity,
            size: self.size(),
            drop_rate: f32::from_bits(self.drop_rate.load(Ordering::Relaxed)),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Move a stale `tail` up to `head - capacity`.
    fn fast_forward(&self) {
        let head = self.head.load(Ordering::Acquire);
        let floor = head.saturating_sub(self.capacity);
        self.tail.fetch_max(floor, Ordering::AcqRel);
    }

    fn blend_drop_rate(&self, sample: f32) {
        let alpha = self.alpha;
        let _ = self
            .drop_rate
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let prev = f32::from_bits(bits);
                Some((prev + alpha * (sample - prev)).to_bits())
            });
    }
}

impl fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRing")
            .field("frame_len", &self.frame_len)
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
