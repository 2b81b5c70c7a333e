use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{CircuitError, Result};

/// Cooperative cancellation for long vocabulary scans.
///
/// Clones share the same flag, so a handle given to a signal handler can stop
/// a scan running on another thread. Scans poll [`Cancellation::check`]
/// between tokens; nothing is interrupted mid-token.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self, completed: usize, total: usize) -> Result<()> {
        if self.is_cancelled() {
            return Err(CircuitError::Cancelled { completed, total });
        }
        Ok(())
    }
}
