//! Output collaborators that accept newly discovered entries.
//!
//! Delivery is at-least-once: after a crash between delivering an entry and
//! recording it as seen, the entry is delivered again on the next poll.
//! Sinks that need exactly-once behaviour must deduplicate on
//! [`EntryIdentity`] themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::feed::{EntryIdentity, RawEntry};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Failed to write entry: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode entry: {0}")]
    Encode(#[from] serde_json::Error),

    /// The receiving side has gone away
    #[error("Output channel closed")]
    Closed,

    /// The sink did not accept the entry in time
    #[error("Delivery timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// An entry not previously seen for its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub identity: EntryIdentity,
    pub entry: RawEntry,
}

impl NewEntry {
    pub fn source_id(&self) -> &str {
        &self.identity.source_id
    }
}

/// Accepts new entries. Must tolerate receiving the same entry twice.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, entry: &NewEntry) -> Result<(), DeliveryError>;
}

/// Logs each entry through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, entry: &NewEntry) -> Result<(), DeliveryError> {
        tracing::info!(
            source = %entry.source_id(),
            identity = %entry.identity.body,
            title = entry.entry.title.as_deref().unwrap_or("(untitled)"),
            link = entry.entry.link.as_deref().unwrap_or(""),
            "New entry"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct EntryRecord<'a> {
    source: &'a str,
    identity: &'a str,
    title: Option<&'a str>,
    link: Option<&'a str>,
    published: Option<DateTime<Utc>>,
    summary: Option<&'a str>,
}

impl<'a> From<&'a NewEntry> for EntryRecord<'a> {
    fn from(e: &'a NewEntry) -> Self {
        EntryRecord {
            source: &e.identity.source_id,
            identity: &e.identity.body,
            title: e.entry.title.as_deref(),
            link: e.entry.link.as_deref(),
            published: e.entry.published,
            summary: e.entry.summary.as_deref(),
        }
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Append to `path`, creating it if needed
    pub async fn append_to(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn deliver(&self, entry: &NewEntry) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(&EntryRecord::from(entry))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Forwards entries into a channel, for embedding the engine in a larger program.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<NewEntry>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<NewEntry>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn deliver(&self, entry: &NewEntry) -> Result<(), DeliveryError> {
        self.tx
            .send(entry.clone())
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}
