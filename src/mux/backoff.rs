//! Reconnection backoff for physical connections
//!
//! Delays grow exponentially from `initial` and are capped at `max`. At most
//! `max_attempts` reconnects are allowed inside one reset window: once the
//! previous attempt is older than `reset_interval` the counter starts over.
//!
//! The policy never reads the clock itself; callers pass `now`, which keeps
//! backoff sequences deterministic under test.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::MuxConfig;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
    reset_interval: Duration,
    jitter: bool,

    /// Attempts made in the current window
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, initial: Duration, max: Duration, reset_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial,
            max,
            reset_interval,
            jitter: false,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn from_config(config: &MuxConfig) -> Self {
        Self::new(
            config.max_reconnect_count,
            config.initial_backoff,
            config.max_backoff,
            config.reconnect_reset_interval,
        )
        .with_jitter(config.backoff_jitter)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a reconnect attempt at `now` and return how long to wait
    /// before it, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) > self.reset_interval {
                self.attempts = 0;
            }
        }
        self.last_attempt = Some(now);

        self.attempts += 1;
        if self.attempts > self.max_attempts {
            return None;
        }

        let shift = (self.attempts - 1).min(31);
        let delay = self.initial.saturating_mul(1u32 << shift).min(self.max);

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let extra = rand::thread_rng().gen_range(Duration::ZERO..=half);
            return Some(half + extra);
        }
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}
