//! Bounded retry policy shared by the frame producer and the hub channel.
//!
//! Both restart paths (respawning the raw-video producer, reconnecting to the
//! hub) go through the same `RetryPolicy` so their pacing is configured in one
//! place and logged the same way.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Retry pacing: exponential growth from `initial_delay` capped at `max_delay`,
/// with optional proportional jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay added at random (0.0 disables).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Same delay on every attempt, retrying forever.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(10))
    }
}

/// Stateful cursor over a `RetryPolicy`.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay to wait before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let base = self.policy.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.jitter > 0.0 && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
            return Some(base.mul_f64(1.0 + extra));
        }
        Some(base)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` until it succeeds, the policy gives up, or `shutdown` is raised.
pub fn retry_with<T>(
    policy: &RetryPolicy,
    shutdown: &AtomicBool,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut backoff = policy.backoff();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    return Err(err.context(format!("{} abandoned during shutdown", what)));
                }
                let Some(delay) = backoff.next_delay() else {
                    return Err(err.context(format!(
                        "{} failed after {} attempts",
                        what,
                        backoff.attempts()
                    )));
                };
                log::warn!(
                    "{} failed (attempt {}): {:#}; retrying in {}ms",
                    what,
                    backoff.attempts(),
                    err,
                    delay.as_millis()
                );
                sleep_unless_shutdown(delay, shutdown);
                if shutdown.load(Ordering::SeqCst) {
                    return Err(anyhow!("{} abandoned during shutdown", what));
                }
            }
        }
    }
}

/// Sleep for `delay`, waking early once `shutdown` is raised.
pub fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let mut remaining = delay;
    while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let step = remaining.min(SHUTDOWN_POLL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_are_capped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500));
        let mut backoff = policy.backoff();
        let delays: Vec<u128> = (0..5)
            .map(|_| backoff.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn bounded_policy_gives_up() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2);
        let mut backoff = policy.backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn jitter_never_shortens_delay() {
        let policy = RetryPolicy::fixed(Duration::from_millis(50)).with_jitter(0.5);
        let mut backoff = policy.backoff();
        for _ in 0..20 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(76));
        }
    }

    #[test]
    fn retry_with_returns_after_transient_failures() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(5);
        let shutdown = AtomicBool::new(false);
        let mut calls = 0;
        let value = retry_with(&policy, &shutdown, "flaky op", || {
            calls += 1;
            if calls < 3 {
                Err(anyhow!("not yet"))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn retry_with_surfaces_exhaustion() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1)).with_max_attempts(1);
        let shutdown = AtomicBool::new(false);
        let result: Result<()> = retry_with(&policy, &shutdown, "spawn producer", || {
            Err(anyhow!("no such binary"))
        });
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("spawn producer failed after 1 attempts"));
    }

    #[test]
    fn sleep_wakes_on_shutdown() {
        let shutdown = AtomicBool::new(true);
        let started = std::time::Instant::now();
        sleep_unless_shutdown(Duration::from_secs(5), &shutdown);
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
