//! Cooperative shutdown signal
//!
//! Every wait in the run loop is a [`Shutdown::sleep`] that re-checks the
//! flag at the configured poll interval, so a signal ends backoff waits
//! within one interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Shared shutdown flag; clones observe the same signal
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking every `poll` to check the flag
    ///
    /// Returns `false` if the sleep was cut short by shutdown.
    pub async fn sleep(&self, duration: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Resolve once shutdown has been requested
    pub async fn triggered(&self, poll: Duration) {
        while !self.is_triggered() {
            tokio::time::sleep(poll).await;
        }
    }
}
