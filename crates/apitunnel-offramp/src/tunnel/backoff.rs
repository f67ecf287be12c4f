//! Reconnect backoff state.

use std::time::{Duration, Instant};

use rand::Rng;

use super::config::ReconnectPolicy;

/// Tracks consecutive failed attempts and hands out the next delay.
///
/// Delays never shrink between resets: each one is the jittered
/// exponential delay, raised to at least the previous delay and capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: ReconnectPolicy,
    attempt: u32,
    last_delay: Duration,
    next_retry: Option<Instant>,
}

impl BackoffState {
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_delay: Duration::ZERO,
            next_retry: None,
        }
    }

    /// Failed attempts since the last reset.
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    pub const fn next_retry(&self) -> Option<Instant> {
        self.next_retry
    }

    pub const fn cap(&self) -> Duration {
        self.policy.max_delay
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` once `max_attempts` is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with(&mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if !self.policy.should_retry(self.attempt) {
            return None;
        }
        let base = self.policy.delay_for_attempt(self.attempt);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 {
            base.mul_f64(1.0 + rng.gen_range(-jitter..=jitter))
        } else {
            base
        };
        let delay = jittered.max(self.last_delay).min(self.policy.max_delay);

        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = delay;
        self.next_retry = Some(Instant::now() + delay);
        Some(delay)
    }

    /// Back to the initial delay, after a successful authentication.
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
        self.next_retry = None;
    }
}
