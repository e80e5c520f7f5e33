// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rolling-window request/token budget for the embedding provider.
//!
//! Usage is counted inside a fixed window. Before every provider call the
//! limiter checks whether requests or estimated tokens already exceed
//! `limit * headroom`; if so it sleeps until the window ends, starts a fresh
//! window, and only then accounts the call.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Time source used by the limiter and the retry policy.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock for tests; `sleep` advances time instead of blocking.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: Mutex<Instant>,
    sleeps: Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[cfg(test)]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Counters for the current window plus the configured ceilings.
#[derive(Debug, Clone)]
pub struct RateBudget {
    pub rpm: u64,
    pub tpm: u64,
    pub headroom: f64,
    pub window: Duration,
    pub requests: u64,
    pub tokens: u64,
    pub window_start: Instant,
}

impl RateBudget {
    pub fn new(rpm: u64, tpm: u64, headroom: f64, window: Duration, now: Instant) -> Self {
        Self {
            rpm,
            tpm,
            headroom: headroom.clamp(0.1, 1.0),
            window,
            requests: 0,
            tokens: 0,
            window_start: now,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rpm == 0 && self.tpm == 0
    }

    fn reset(&mut self, now: Instant) {
        self.requests = 0;
        self.tokens = 0;
        self.window_start = now;
    }

    fn exhausted(&self) -> bool {
        let over_requests = self.rpm > 0 && self.requests as f64 > self.rpm as f64 * self.headroom;
        let over_tokens = self.tpm > 0 && self.tokens as f64 > self.tpm as f64 * self.headroom;
        over_requests || over_tokens
    }
}

/// Thread-safe limiter; callers block inside [`RateLimiter::acquire`].
pub struct RateLimiter {
    budget: Mutex<RateBudget>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(rpm: u64, tpm: u64, headroom: f64, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let budget = RateBudget::new(rpm, tpm, headroom, window, clock.now());
        Self {
            budget: Mutex::new(budget),
            clock,
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.rpm(),
            config.tpm(),
            config.headroom(),
            config.window(),
            clock,
        )
    }

    /// Accounts one request of `tokens` estimated tokens, sleeping first when
    /// the window's budget is already spent. Returns the time slept.
    pub fn acquire(&self, tokens: u64) -> Duration {
        let mut budget = self.budget.lock();
        if budget.is_unlimited() {
            return Duration::ZERO;
        }

        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(budget.window_start);
        if elapsed >= budget.window {
            budget.reset(now);
        }

        let mut slept = Duration::ZERO;
        if budget.exhausted() {
            let wait = budget.window.saturating_sub(elapsed);
            tracing::info!(
                sleep_ms = wait.as_millis() as u64,
                requests = budget.requests,
                rpm = budget.rpm,
                tokens = budget.tokens,
                tpm = budget.tpm,
                "rate budget exhausted, waiting for window reset"
            );
            self.clock.sleep(wait);
            slept = wait;
            let now = self.clock.now();
            budget.reset(now);
        }

        budget.requests += 1;
        budget.tokens += tokens;
        slept
    }

    /// Snapshot of the current counters.
    pub fn snapshot(&self) -> RateBudget {
        self.budget.lock().clone()
    }
}
