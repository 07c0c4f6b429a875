use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::feed::CacheHints;
use crate::storage::{ScheduleState, StoredSource};

/// Per-source lifecycle: `Idle -> Due -> Polling -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// Waiting in the ready queue for its next-eligible time
    Idle,
    /// Popped from the queue, waiting for a worker slot
    Due,
    /// A poll is in flight; the source is out of the queue until it finishes
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    /// Failed more consecutive times than the configured threshold; still polled
    Degraded,
}

/// A polled endpoint and its scheduling state.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub base_interval: Duration,
    pub max_interval: Duration,
    /// Only the first `max_entries` document entries are considered
    pub max_entries: Option<usize>,
    pub enabled: bool,
    pub schedule: ScheduleState,
    pub cache_hints: CacheHints,
    pub state: PollState,
    pub health: SourceHealth,
}

impl Source {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        base_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            base_interval,
            max_interval: max_interval.max(base_interval),
            max_entries: None,
            enabled: true,
            schedule: ScheduleState::default(),
            cache_hints: CacheHints::default(),
            state: PollState::Idle,
            health: SourceHealth::Healthy,
        }
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Adopt persisted schedule and cache validators from a previous run
    pub fn restore(&mut self, stored: StoredSource) {
        self.schedule = stored.schedule;
        self.cache_hints = stored.cache_hints;
    }

    /// When the source should first be polled in this run: immediately if it
    /// never was, otherwise `max(now, stored next_poll_at)`.
    pub fn resume_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.schedule.next_poll_at {
            Some(next) if next > now => next,
            _ => now,
        }
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            id: self.id.clone(),
            state: self.state,
            health: self.health,
            consecutive_failures: self.schedule.consecutive_failures,
            next_poll_at: self.schedule.next_poll_at,
            last_success_at: self.schedule.last_success_at,
        }
    }
}

/// Point-in-time view of a source for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SourceSnapshot {
    pub id: String,
    pub state: PollState,
    pub health: SourceHealth,
    pub consecutive_failures: u32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}
