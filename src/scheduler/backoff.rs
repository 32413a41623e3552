//! Exponential backoff policy for run retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pure, stateless retry policy: `delay(attempt) = min(max_delay,
/// base_delay * multiplier^(attempt-1))`, optionally spread by a jitter
/// fraction. Attempts are 1-indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay used as symmetric jitter, e.g. 0.25 spreads a
    /// 4s delay across 3s..5s. Zero disables jitter.
    pub jitter: f64,
    pub max_delay: Duration,
    /// Total attempts before a run is abandoned.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// The capped exponential delay before jitter. Monotonically
    /// non-decreasing in `attempt` and never above `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The delay to sleep before re-enqueueing `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        // Symmetric jitter from sub-second clock noise; good enough for
        // spreading retries, no dedicated RNG dependency needed.
        let spread = (sub_second_unit() * 2.0 - 1.0) * self.jitter;
        let millis = base.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Pseudo-random value in 0.0..1.0 derived from the clock's nanoseconds.
fn sub_second_unit() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let p = policy();
        assert_eq!(p.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn attempt_zero_is_immediate() {
        assert_eq!(policy().base_delay_for(0), Duration::ZERO);
    }

    #[test]
    fn monotone_and_capped() {
        let p = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            multiplier: 3.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 20,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..20 {
            let delay = p.base_delay_for(attempt);
            assert!(delay >= previous, "attempt {attempt} regressed");
            assert!(delay <= p.max_delay);
            previous = delay;
        }
        assert_eq!(p.base_delay_for(19), p.max_delay);
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let p = BackoffPolicy {
            jitter: 0.25,
            ..policy()
        };
        for attempt in 1..6 {
            let base = p.base_delay_for(attempt).as_millis() as f64;
            for _ in 0..50 {
                let jittered = p.delay_for(attempt).as_millis() as f64;
                assert!(jittered >= base * 0.74, "attempt {attempt}: {jittered} too low");
                assert!(jittered <= base * 1.26, "attempt {attempt}: {jittered} too high");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = policy();
        assert_eq!(p.delay_for(3), p.base_delay_for(3));
    }
}
