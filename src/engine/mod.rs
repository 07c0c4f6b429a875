//! The ingestion engine.
//!
//! A [`Engine`] keeps every source in a [`ReadyQueue`] ordered by
//! next-eligible time. Due sources are handed to a bounded pool of workers;
//! each poll runs the [`pipeline`](poll) (fetch, parse, diff against the
//! state store), delivers new entries to the sink and records them as seen,
//! then lets the [`BackoffPolicy`] decide when the source is due again.
//!
//! # Guarantees
//!
//! - at most one poll in flight per source; polls of one source never overlap
//! - an entry is delivered before it is recorded as seen, so delivery is
//!   at-least-once across crashes
//! - failures of one source (fetch, parse, delivery, state store) never stop
//!   the loop or delay other sources

mod backoff;
mod pipeline;
mod queue;
mod scheduler;
mod source;

pub use backoff::{BackoffPolicy, Decision, MAX_DELAY, MAX_JITTER};
pub use pipeline::{poll, PollOutcome, PollReport};
pub use queue::ReadyQueue;
pub use scheduler::{Engine, EngineSettings, PollSummary};
pub use source::{PollState, Source, SourceHealth, SourceSnapshot};
