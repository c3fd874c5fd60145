//! Zero-argument publish/subscribe with token cancellation.
//!
//! [`Event::emit`] walks a snapshot of the subscriber list taken when the
//! dispatch starts, so a handler may subscribe or cancel (itself or anyone
//! else) while it runs:
//!
//! * a subscription added during a dispatch is first called on the next one;
//! * a subscription cancelled during a dispatch is skipped for the rest of it.
//!
//! Each slot carries a re-entrant gate held for the duration of its
//! handler.  Cancelling from another thread waits for an in-flight call of
//! that handler to return, so once [`Subscription::cancel`] returns the
//! handler is never entered again.  Cancelling from inside the handler itself
//! re-enters the gate and does not block.
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use wake_stream::events::Event;
//!
//! let event = Event::new("detected");
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&hits);
//! let sub = event.subscribe(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! event.emit();
//! drop(sub);
//! event.emit();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

type Handler = Box<dyn Fn() + Send + Sync>;

struct Slot {
    handler: Handler,
    /// `true` while subscribed; read and written only under the gate.
    gate: ReentrantMutex<Cell<bool>>,
    /// Lock-free mirror of the gate value, used for pruning.
    live: AtomicBool,
}

impl Slot {
    fn invoke(&self) {
        let active = self.gate.lock();
        if active.get() {
            (self.handler)();
        }
    }

    fn cancel(&self) {
        let active = self.gate.lock();
        active.set(false);
        self.live.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A named notification with any number of subscribers.
pub struct Event {
    name: &'static str,
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl Event {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register `handler`.  It stays subscribed until the returned token is
    /// cancelled or dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let slot = Arc::new(Slot {
            handler: Box::new(handler),
            gate: ReentrantMutex::new(Cell::new(true)),
            live: AtomicBool::new(true),
        });

        let mut slots = self.slots.lock();
        slots.retain(|s| s.live.load(Ordering::Acquire));
        slots.push(Arc::clone(&slot));

        Subscription { slot }
    }

    /// Call every handler that is subscribed when the dispatch starts and is
    /// still subscribed when its turn comes.
    pub fn emit(&self) {
        let snapshot: Vec<Arc<Slot>> = {
            let mut slots = self.slots.lock();
            slots.retain(|s| s.live.load(Ordering::Acquire));
            slots.clone()
        };

        log::trace!("event: {} -> {} subscriber(s)", self.name, snapshot.len());
        for slot in &snapshot {
            slot.invoke();
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.live.load(Ordering::Acquire))
            .count()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Cancellation token returned by [`Event::subscribe`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    /// Unsubscribe.  Idempotent.
    pub fn cancel(&self) {
        self.slot.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.slot.live.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionEvents
// ---------------------------------------------------------------------------

/// Utterance lifecycle notifications published by a detection session.
#[derive(Debug)]
pub struct SessionEvents {
    /// Wake word verified.
    pub detected: Event,
    /// Speech confirmed after the drop guard.
    pub started: Event,
    /// Silence run reached the threshold; utterance over.
    pub silenced: Event,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self {
            detected: Event::new("detected"),
            started: Event::new("started"),
            silenced: Event::new("silenced"),
        }
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
