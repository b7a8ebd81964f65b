//! Cooperative shutdown and fixed-delay retry.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Process-wide cancellation flag. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `dur` in short slices. Returns `false` if shutdown was
    /// triggered before the full duration elapsed.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Fixed-delay retry for transient infrastructure failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries until shutdown.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    /// Runs `op` until it succeeds, attempts run out, or shutdown is triggered.
    pub fn run<T>(
        &self,
        shutdown: &Shutdown,
        label: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_triggered() {
                return Err(anyhow!("{}: shutdown requested", label));
            }
            attempt = attempt.saturating_add(1);
            match op() {
                Ok(v) => {
                    if attempt > 1 {
                        log::info!("{}: succeeded after {} attempts", label, attempt);
                    }
                    return Ok(v);
                }
                Err(e) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(e.context(format!("{}: gave up after {} attempts", label, attempt)));
                    }
                    log::warn!(
                        "{}: attempt {} failed: {:#}. Retrying in {:?}",
                        label,
                        attempt,
                        e,
                        self.delay
                    );
                    if !shutdown.sleep(self.delay) {
                        return Err(anyhow!("{}: shutdown requested", label));
                    }
                }
            }
        }
    }
}
