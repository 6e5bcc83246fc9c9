//! Per-agent circuit breaker

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Consecutive-failure circuit breaker.
///
/// The breaker is open while `failure_count >= threshold` and the last
/// failure is younger than `reset_timeout`. Once the window has passed the
/// next check clears the count and traffic flows again; no trial request
/// is made first.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_count: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    reset_timeout: Duration,
}

/// Serializable view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub failure_count: u32,
    pub threshold: u32,
    pub reset_timeout_secs: u64,
    pub open: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            threshold: threshold.max(1),
            reset_timeout,
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());

        if self.failure_count == self.threshold {
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                self.failure_count
            );
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
    }

    /// Check the breaker, resetting it if the open window has elapsed
    pub fn is_open(&mut self) -> bool {
        if self.failure_count < self.threshold {
            return false;
        }

        match self.last_failure {
            Some(at) if at.elapsed() <= self.reset_timeout => true,
            _ => {
                info!("Circuit breaker reset after {:?}", self.reset_timeout);
                self.failure_count = 0;
                false
            }
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn snapshot(&mut self) -> BreakerSnapshot {
        let open = self.is_open();
        BreakerSnapshot {
            failure_count: self.failure_count,
            threshold: self.threshold,
            reset_timeout_secs: self.reset_timeout.as_secs(),
            open,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
