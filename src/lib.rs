//! skimd: a feed ingestion daemon.
//!
//! Polls a configured set of RSS/Atom sources on independent schedules,
//! resolves a stable identity for every entry, and delivers each entry
//! downstream once, with dedup state persisted in SQLite across restarts.

pub mod config;
pub mod engine;
pub mod feed;
pub mod sink;
pub mod storage;
pub mod util;
