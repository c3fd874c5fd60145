//! Named OS-thread worker with cooperative, bounded shutdown.
//!
//! The loop body receives the shared `running` flag and is expected to check
//! it between blocking calls.  [`Worker::stop`] clears the flag and polls the
//! thread until it exits; a thread that ignores the flag past the deadline is
//! detached and reported, never waited on forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long [`Worker::stop`] waits, and how often it checks.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownPolicy {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2_000),
            poll: Duration::from_millis(10),
        }
    }
}

/// Outcome of [`Worker::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Joined,
    /// The thread did not observe the flag in time and was detached.
    Detached,
}

pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    policy: ShutdownPolicy,
}

impl Worker {
    /// Spawn `body` on a thread called `name`.
    pub fn spawn<F>(name: &str, policy: ShutdownPolicy, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || body(flag))?;

        Ok(Self {
            name: name.into(),
            running,
            handle: Some(handle),
            policy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Clear the running flag and wait for the thread within the policy
    /// deadline.  Idempotent.
    pub fn stop(&mut self) -> StopOutcome {
        self.running.store(false, Ordering::Release);

        let Some(handle) = self.handle.take() else {
            return StopOutcome::Joined;
        };

        let deadline = Instant::now() + self.policy.timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::error!(
                    "worker: thread '{}' did not exit within {:?}, detaching it",
                    self.name,
                    self.policy.timeout
                );
                return StopOutcome::Detached;
            }
            std::thread::sleep(self.policy.poll);
        }

        if handle.join().is_err() {
            log::error!("worker: thread '{}' panicked", self.name);
        }
        StopOutcome::Joined
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> ShutdownPolicy {
        ShutdownPolicy {
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(5),
        }
    }

    #[test]
    fn cooperative_loop_is_joined() {
        let mut worker = Worker::spawn("coop", quick(), |running| {
            while running.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("spawn");

        assert_eq!(worker.name(), "coop");
        assert!(!worker.is_finished());
        assert_eq!(worker.stop(), StopOutcome::Joined);
        assert!(worker.is_finished());
        // Second stop is a no-op.
        assert_eq!(worker.stop(), StopOutcome::Joined);
    }

    #[test]
    fn stuck_loop_is_detached_after_timeout() {
        let mut worker = Worker::spawn("stuck", quick(), |_running| {
            std::thread::sleep(Duration::from_secs(2));
        })
        .expect("spawn");

        let started = Instant::now();
        assert_eq!(worker.stop(), StopOutcome::Detached);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn finished_body_joins_immediately() {
        let mut worker = Worker::spawn("done", quick(), |_| {}).expect("spawn");
        std::thread::sleep(Duration::from_millis(20));
        assert!(worker.is_finished());
        assert_eq!(worker.stop(), StopOutcome::Joined);
    }
}
