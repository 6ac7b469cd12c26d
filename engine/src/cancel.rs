//! Cancellation handle carrying an optional deadline.
//!
//! Every long-running operation takes a `CancelToken`. A token is cancelled
//! when `cancel()` is called on it or any ancestor, or when its deadline
//! passes. Children inherit the earliest deadline of their ancestors.

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token with no deadline.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: None,
            }),
        }
    }

    /// A child token; its deadline is the earlier of `timeout` from now and
    /// the parent's deadline.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (own, self.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// True only for an explicit `cancel()` on this token or an ancestor,
    /// ignoring deadlines.
    pub fn is_explicitly_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .map(|p| p.is_explicitly_cancelled())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_explicitly_cancelled() || self.deadline_passed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp a per-call timeout to what is left on this token.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(timeout),
            None => timeout,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_explicitly_cancelled() {
            return Err(Error::Timeout("operation cancelled".into()));
        }
        if self.deadline_passed() {
            return Err(Error::Timeout("deadline exceeded".into()));
        }
        Ok(())
    }

    /// Sleeps for `duration` unless cancelled first. Returns false when the
    /// sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}
