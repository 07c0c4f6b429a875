use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    due: DateTime<Utc>,
    seq: u64,
    source_id: String,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Slot>>,
    /// Live slot per source; heap entries with another seq are stale
    live: HashMap<String, u64>,
    seq: u64,
}

impl Inner {
    fn discard_stale(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.live.get(&top.source_id) == Some(&top.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Sources ordered by next-eligible poll time.
///
/// Each source appears at most once: scheduling a source that is already
/// queued replaces its previous slot. The lock only covers queue mutation.
#[derive(Default)]
pub struct ReadyQueue {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Queue state stays consistent across a panicking holder
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `source_id` to become due at `due`, replacing any earlier slot
    pub fn schedule(&self, source_id: &str, due: DateTime<Utc>) {
        {
            let mut inner = self.lock();
            inner.seq += 1;
            let seq = inner.seq;
            inner.live.insert(source_id.to_string(), seq);
            inner.heap.push(Reverse(Slot {
                due,
                seq,
                source_id: source_id.to_string(),
            }));
        }
        self.changed.notify_one();
    }

    /// Take `source_id` out of the queue. Returns whether it was queued.
    pub fn remove(&self, source_id: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.live.remove(source_id).is_some();
        inner.discard_stale();
        removed
    }

    /// Earliest next-eligible time, if anything is queued
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.lock();
        inner.discard_stale();
        inner.heap.peek().map(|Reverse(slot)| slot.due)
    }

    /// Pop the earliest source if it is due at `now`
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<String> {
        let mut inner = self.lock();
        inner.discard_stale();
        let is_due = matches!(inner.heap.peek(), Some(Reverse(slot)) if slot.due <= now);
        if !is_due {
            return None;
        }
        let Reverse(slot) = inner.heap.pop()?;
        inner.live.remove(&slot.source_id);
        Some(slot.source_id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next `schedule` call (or immediately if one
    /// happened since the last wait)
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
