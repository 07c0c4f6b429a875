use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use super::pipeline::PollOutcome;
use super::source::{Source, SourceHealth};

/// Upper bound accepted for the jitter ratio.
pub const MAX_JITTER: f64 = 0.5;

/// Longest delay between two polls of a source, jitter included.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Where a source goes after a poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub next_poll_at: DateTime<Utc>,
    pub delay: Duration,
    pub health: SourceHealth,
}

/// Computes next-eligible poll times from poll outcomes.
///
/// Success resets to the source's base interval. Each consecutive failure
/// doubles the delay up to the source's ceiling, with bounded random jitter
/// so sources sharing an interval do not retry in lockstep. Once it has
/// failed more than `degraded_after` times in a row a source is marked
/// degraded but keeps polling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    degraded_after: u32,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(degraded_after: u32, jitter: f64) -> Self {
        Self {
            degraded_after,
            jitter: jitter.clamp(0.0, MAX_JITTER),
        }
    }

    /// Deterministic backoff delay after `failures` consecutive failures.
    /// `failures == 0` yields `base`. Never exceeds [`MAX_DELAY`].
    pub fn delay_for(&self, base: Duration, max: Duration, failures: u32) -> Duration {
        let max = max.min(MAX_DELAY);
        if failures == 0 {
            return base.min(MAX_DELAY);
        }
        let factor = 2u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(max).min(max)
    }

    pub fn health(&self, failures: u32) -> SourceHealth {
        if failures > self.degraded_after {
            SourceHealth::Degraded
        } else {
            SourceHealth::Healthy
        }
    }

    /// Apply `outcome` to the source's failure count and compute when it is
    /// next due. Does not move the source's `next_poll_at`; the scheduler does.
    pub fn next_poll_time(
        &self,
        source: &mut Source,
        outcome: &PollOutcome,
        now: DateTime<Utc>,
    ) -> Decision {
        let delay = if outcome.is_success() {
            source.schedule.consecutive_failures = 0;
            source.schedule.last_success_at = Some(now);
            source.base_interval.min(MAX_DELAY)
        } else {
            source.schedule.consecutive_failures =
                source.schedule.consecutive_failures.saturating_add(1);
            let raw = self.delay_for(
                source.base_interval,
                source.max_interval,
                source.schedule.consecutive_failures,
            );
            self.jittered(raw)
        };

        let step = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        let next_poll_at = now
            .checked_add_signed(step)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Decision {
            next_poll_at,
            delay,
            health: self.health(source.schedule.consecutive_failures),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).ok().unwrap_or(delay).min(MAX_DELAY)
    }
}
