use chrono::{DateTime, Utc};
use feed_rs::parser;

use super::fetcher::CacheHints;

/// One item exactly as the source published it.
///
/// Never persisted; only the derived [`EntryIdentity`](super::EntryIdentity) is.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    /// `published`, falling back to `updated`
    pub published: Option<DateTime<Utc>>,
    /// Source-provided unique token (RSS `guid`, Atom `id`)
    pub token: Option<String>,
    pub summary: Option<String>,
}

/// The parsed result of one fetch. Discarded after diffing.
#[derive(Debug, Clone, Default)]
pub struct FeedDocument {
    pub title: Option<String>,
    /// Entries in document order
    pub entries: Vec<RawEntry>,
    /// Validators returned with this document, handed back on the next fetch
    pub cache_hints: CacheHints,
}

/// Parse RSS/Atom/JSON Feed bytes into a [`FeedDocument`].
///
/// feed-rs synthesizes an id for entries that carry none; that synthetic id is
/// suppressed here so identity resolution can fall back to the link instead.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedDocument, feed_rs::parser::ParseFeedError> {
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)?;

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry.title.map(|t| t.content);
            let token = if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id)
            };

            RawEntry {
                title,
                link,
                published,
                token,
                summary,
            }
        })
        .collect();

    Ok(FeedDocument {
        title: feed.title.map(|t| t.content),
        entries,
        cache_hints: CacheHints::default(),
    })
}
