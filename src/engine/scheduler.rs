use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::feed::{ErrorKind, Fetcher};
use crate::sink::{DeliveryError, Sink};
use crate::storage::{StateStore, StateStoreError};

use super::backoff::{BackoffPolicy, Decision};
use super::pipeline::{self, PollOutcome, PollReport};
use super::queue::ReadyQueue;
use super::source::{PollState, Source, SourceHealth, SourceSnapshot};

/// Longest the dispatcher sleeps with an empty queue before re-checking
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Engine-wide tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Maximum polls in flight at once
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    /// Upper bound on a single `Sink::deliver` call
    pub delivery_timeout: Duration,
    /// How long shutdown waits for in-flight polls before aborting them
    pub shutdown_grace: Duration,
    /// Seen identities kept per source
    pub retention_per_source: usize,
    pub backoff: BackoffPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            fetch_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            retention_per_source: 1000,
            backoff: BackoffPolicy::new(5, 0.1),
        }
    }
}

/// What reconciling a poll against the sink and the store produced.
struct Reconciled {
    outcome: PollOutcome,
    delivered: usize,
    /// New entries the sink refused or did not take in time
    failed: usize,
}

/// Summary of one completed poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub source_id: String,
    pub outcome: PollOutcome,
    /// New entries the sink accepted and that were recorded as seen
    pub delivered: usize,
    pub next_poll_at: DateTime<Utc>,
}

/// The polling engine: owns the sources, the ready queue and the collaborators.
///
/// Instances share nothing; several engines can run side by side.
pub struct Engine {
    sources: Mutex<HashMap<String, Source>>,
    queue: Arc<ReadyQueue>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn Sink>,
    store: Arc<dyn StateStore>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn Sink>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self::with_queue(settings, fetcher, sink, store, Arc::new(ReadyQueue::new()))
    }

    pub fn with_queue(
        settings: EngineSettings,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn Sink>,
        store: Arc<dyn StateStore>,
        queue: Arc<ReadyQueue>,
    ) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            queue,
            fetcher,
            sink,
            store,
            settings: EngineSettings {
                concurrency: settings.concurrency.max(1),
                ..settings
            },
        }
    }

    fn sources(&self) -> MutexGuard<'_, HashMap<String, Source>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register sources, restore their persisted state and queue the enabled
    /// ones at `max(now, stored next_poll_at)`.
    ///
    /// # Errors
    ///
    /// Returns the first [`StateStoreError`] raised while registering a
    /// source. Sources registered before the failure stay loaded.
    pub async fn load(&self, sources: Vec<Source>) -> Result<(), StateStoreError> {
        let now = Utc::now();
        for mut source in sources {
            let stored = self
                .store
                .register_source(&source.id, &source.url, source.enabled)
                .await?;
            source.restore(stored);
            source.health = self
                .settings
                .backoff
                .health(source.schedule.consecutive_failures);
            source.state = PollState::Idle;

            if source.enabled {
                let due = source.resume_at(now);
                tracing::debug!(source = %source.id, due = %due, "Source scheduled");
                self.queue.schedule(&source.id, due);
            } else {
                tracing::info!(source = %source.id, "Source disabled, not scheduling");
            }
            self.sources().insert(source.id.clone(), source);
        }
        Ok(())
    }

    /// Per-source diagnostic view, ordered by id
    pub fn snapshot(&self) -> Vec<SourceSnapshot> {
        let mut snapshot: Vec<SourceSnapshot> =
            self.sources().values().map(Source::snapshot).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    pub fn queue(&self) -> &Arc<ReadyQueue> {
        &self.queue
    }

    /// Run the scheduling loop until `shutdown` turns true or its sender is dropped.
    ///
    /// Due sources are polled concurrently up to the configured ceiling. Each
    /// poll is bounded by the fetch timeout and by the delivery timeout per
    /// new entry, so one hung source or sink never holds up the others.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Receiver of the shutdown flag. Sending `true` (or
    ///   dropping the sender) stops the loop without waiting for the next
    ///   due time.
    ///
    /// # Shutdown
    ///
    /// No new polls start once shutdown is signalled. In-flight polls get
    /// `shutdown_grace` to finish; whatever is still running after that is
    /// aborted. Sources whose poll was aborted keep their persisted
    /// schedule and are picked up again on the next start.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            sources = self.queue.len(),
            concurrency = self.settings.concurrency,
            "Engine started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let now = Utc::now();
            if let Some(id) = self.queue.pop_due(now) {
                self.set_state(&id, PollState::Due);
                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    changed = shutdown.changed() => {
                        // Not polled; back into the queue as still due
                        self.set_state(&id, PollState::Idle);
                        self.queue.schedule(&id, now);
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let engine = Arc::clone(&self);
                in_flight.spawn(async move {
                    let summary = engine.poll_source(&id).await;
                    drop(permit);
                    summary
                });
                continue;
            }

            let wait = self
                .queue
                .next_due()
                .map(|due| (due - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.queue.changed() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Engine stopping, draining in-flight polls");
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                abandoned = in_flight.len(),
                grace_secs = self.settings.shutdown_grace.as_secs(),
                "In-flight polls did not finish in time, aborting"
            );
            in_flight.abort_all();
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
            self.requeue_aborted();
        }
        tracing::info!("Engine stopped");
    }

    /// Poll every enabled source once, concurrently up to the ceiling.
    /// Results are returned in completion order.
    pub async fn run_once(self: &Arc<Self>) -> Vec<PollSummary> {
        let ids: Vec<String> = {
            let sources = self.sources();
            let mut ids: Vec<String> = sources
                .values()
                .filter(|s| s.enabled)
                .map(|s| s.id.clone())
                .collect();
            ids.sort();
            ids
        };

        stream::iter(ids)
            .map(|id| {
                let engine = Arc::clone(self);
                async move {
                    engine.queue.remove(&id);
                    engine.poll_source(&id).await
                }
            })
            .buffer_unordered(self.settings.concurrency)
            .filter_map(|summary| async move { summary })
            .collect()
            .await
    }

    /// Aborted polls never reached their requeue; put them back as due so a
    /// later `run` picks them up. Their persisted schedule is the pre-poll one.
    fn requeue_aborted(&self) {
        let aborted: Vec<String> = self
            .sources()
            .values_mut()
            .filter(|source| source.state == PollState::Polling)
            .map(|source| {
                source.state = PollState::Idle;
                source.id.clone()
            })
            .collect();
        let now = Utc::now();
        for id in aborted {
            self.queue.schedule(&id, now);
        }
    }

    fn set_state(&self, id: &str, state: PollState) {
        if let Some(source) = self.sources().get_mut(id) {
            source.state = state;
        }
    }

    /// Move a source to `Polling` and hand out a copy, unless a poll is
    /// already in flight for it.
    fn begin_poll(&self, id: &str) -> Option<Source> {
        let mut sources = self.sources();
        let source = sources.get_mut(id)?;
        if source.state == PollState::Polling {
            tracing::warn!(source = %id, "Poll already in flight, skipping");
            return None;
        }
        source.state = PollState::Polling;
        Some(source.clone())
    }

    /// One full cycle for a source: fetch and diff, deliver and record new
    /// entries, apply backoff, persist, and requeue.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier of a source previously passed to [`Engine::load`]
    ///
    /// # Returns
    ///
    /// `None` if the source is unknown or a poll for it is already in
    /// flight. Otherwise a [`PollSummary`]; every failure (fetch, parse,
    /// state store) is reported in its `outcome` rather than as an error.
    pub async fn poll_source(&self, id: &str) -> Option<PollSummary> {
        let source = self.begin_poll(id)?;

        let report = pipeline::poll(
            &source,
            self.fetcher.as_ref(),
            self.store.as_ref(),
            self.settings.fetch_timeout,
        )
        .await;
        let PollReport {
            outcome,
            cache_hints,
            still_present,
        } = report;

        let Reconciled {
            mut outcome,
            delivered,
            failed,
        } = match self.reconcile(&source, outcome, &still_present).await {
            Ok(reconciled) => reconciled,
            Err(e) => {
                tracing::warn!(source = %id, error = %e, "State store failed during reconcile");
                Reconciled {
                    outcome: PollOutcome::Error(ErrorKind::Storage),
                    delivered: 0,
                    failed: 0,
                }
            }
        };

        let mut updated = source.clone();
        // Keep the old validators while any entry is undelivered, otherwise
        // the next conditional fetch answers "unchanged" and hides it
        if outcome.is_success() && failed == 0 {
            updated.cache_hints = cache_hints;
        }
        let mut decision = self.apply_backoff(&mut updated, &outcome);

        if let Err(e) = self
            .store
            .save_schedule(id, &updated.schedule, &updated.cache_hints)
            .await
        {
            tracing::warn!(source = %id, error = %e, "Failed to persist schedule, rescheduling as failed");
            // Restart from the pre-poll state so the failure is counted once
            outcome = PollOutcome::Error(ErrorKind::Storage);
            updated = source.clone();
            decision = self.apply_backoff(&mut updated, &outcome);
        }

        self.log_outcome(&source, &updated, &outcome, delivered, &decision);

        updated.state = PollState::Idle;
        let enabled = updated.enabled;
        self.sources().insert(id.to_string(), updated);
        if enabled {
            self.queue.schedule(id, decision.next_poll_at);
        }

        Some(PollSummary {
            source_id: id.to_string(),
            outcome,
            delivered,
            next_poll_at: decision.next_poll_at,
        })
    }

    fn apply_backoff(&self, source: &mut Source, outcome: &PollOutcome) -> Decision {
        let decision = self
            .settings
            .backoff
            .next_poll_time(source, outcome, Utc::now());
        source.schedule.next_poll_at = Some(decision.next_poll_at);
        source.health = decision.health;
        decision
    }

    /// Deliver each new entry and then record it as seen.
    ///
    /// Delivery happens first so a crash in between re-delivers rather than
    /// loses the entry. A failed or timed-out delivery leaves that entry
    /// unrecorded for the next poll without affecting its siblings. A store
    /// failure ends the cycle for this source.
    async fn reconcile(
        &self,
        source: &Source,
        outcome: PollOutcome,
        still_present: &[String],
    ) -> Result<Reconciled, StateStoreError> {
        let entries = match &outcome {
            PollOutcome::NewEntries(entries) => entries,
            _ => {
                return Ok(Reconciled {
                    outcome,
                    delivered: 0,
                    failed: 0,
                })
            }
        };

        let mut delivered = 0;
        let mut failed = 0;
        for entry in entries {
            let timeout = self.settings.delivery_timeout;
            let result = tokio::time::timeout(timeout, self.sink.deliver(entry))
                .await
                .unwrap_or(Err(DeliveryError::Timeout(timeout)));
            if let Err(e) = result {
                tracing::warn!(
                    source = %source.id,
                    identity = %entry.identity.body,
                    error = %e,
                    "Delivery failed, entry will be retried on the next poll"
                );
                failed += 1;
                continue;
            }
            self.store.mark_seen(&entry.identity, Utc::now()).await?;
            delivered += 1;
        }

        let now = Utc::now();
        self.store.touch_seen(&source.id, still_present, now).await?;
        // Never prune identities the current document still lists
        let keep = self
            .settings
            .retention_per_source
            .max(entries.len() + still_present.len());
        let pruned = self.store.enforce_retention(&source.id, keep).await?;
        if pruned > 0 {
            tracing::debug!(source = %source.id, pruned = pruned, "Pruned seen entries");
        }

        Ok(Reconciled {
            outcome,
            delivered,
            failed,
        })
    }

    fn log_outcome(
        &self,
        before: &Source,
        after: &Source,
        outcome: &PollOutcome,
        delivered: usize,
        decision: &Decision,
    ) {
        let failures = after.schedule.consecutive_failures;
        match outcome {
            PollOutcome::Unchanged => {
                tracing::debug!(source = %after.id, next = %decision.next_poll_at, "Source unchanged");
            }
            PollOutcome::NewEntries(entries) if entries.is_empty() => {
                tracing::debug!(source = %after.id, next = %decision.next_poll_at, "No new entries");
            }
            PollOutcome::NewEntries(entries) => {
                tracing::info!(
                    source = %after.id,
                    new = entries.len(),
                    delivered = delivered,
                    "New entries"
                );
            }
            PollOutcome::Error(kind) if after.health == SourceHealth::Degraded => {
                tracing::warn!(
                    source = %after.id,
                    kind = %kind,
                    failures = failures,
                    retry_in_secs = decision.delay.as_secs(),
                    "Degraded source failed again"
                );
            }
            PollOutcome::Error(kind) => {
                tracing::info!(
                    source = %after.id,
                    kind = %kind,
                    failures = failures,
                    retry_in_secs = decision.delay.as_secs(),
                    "Poll failed, backing off"
                );
            }
        }

        match (before.health, after.health) {
            (SourceHealth::Healthy, SourceHealth::Degraded) => {
                tracing::warn!(source = %after.id, failures = failures, "Source degraded");
            }
            (SourceHealth::Degraded, SourceHealth::Healthy) => {
                tracing::info!(source = %after.id, "Source recovered");
            }
            _ => {}
        }
    }
}

fn log_join(joined: Result<Option<PollSummary>, tokio::task::JoinError>) {
    match joined {
        Err(e) if e.is_cancelled() => tracing::debug!("Poll task aborted"),
        Err(e) => tracing::error!(error = %e, "Poll task panicked"),
        Ok(_) => {}
    }
}
