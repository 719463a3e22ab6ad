//! Execution rate limiting.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::error::{WorkerError, WorkerResult};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Admits at most `max` executions in any window of length `window`.
///
/// Executions are spaced `window / max` apart with no burst, so a backlog
/// of due jobs drains at a steady pace instead of in one spike.
pub struct ExecutionLimiter {
    limiter: DirectRateLimiter,
    max: u32,
    window: Duration,
}

impl ExecutionLimiter {
    pub fn new(max: u32, window: Duration) -> WorkerResult<Self> {
        if max == 0 {
            return Err(WorkerError::config_error("rate limit max must be positive"));
        }

        let quota = Quota::with_period(window / max)
            .ok_or_else(|| WorkerError::config_error("rate limit window must be positive"))?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            max,
            window,
        })
    }

    /// Wait until another execution may start.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a slot without waiting, if one is free.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
