//! Stable per-source identities for feed entries.
//!
//! Resolution order:
//!
//! 1. the source-provided token (RSS `guid`, Atom `id`), verbatim
//! 2. the entry link, normalized with [`normalize_link`]
//! 3. a SHA-256 fingerprint over the title and the timestamp, or the title and
//!    a normalized summary prefix when the entry carries no timestamp
//!
//! Identities are scoped to a source and never compared across sources.

use sha2::{Digest, Sha256};
use url::Url;

use super::parser::RawEntry;

/// Characters of normalized summary that feed the fingerprint fallback.
const SUMMARY_PREFIX_CHARS: usize = 200;

/// The key used to decide whether an entry was already emitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct EntryIdentity {
    pub source_id: String,
    pub body: String,
}

impl std::fmt::Display for EntryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_id, self.body)
    }
}

/// Resolve the identity of `entry` within `source_id`. Pure and deterministic.
pub fn identify(entry: &RawEntry, source_id: &str) -> EntryIdentity {
    EntryIdentity {
        source_id: source_id.to_string(),
        body: identity_body(entry),
    }
}

fn identity_body(entry: &RawEntry) -> String {
    if let Some(token) = entry.token.as_deref() {
        if !token.trim().is_empty() {
            return token.to_string();
        }
    }

    if let Some(link) = entry.link.as_deref() {
        if !link.trim().is_empty() {
            return normalize_link(link);
        }
    }

    fingerprint(entry)
}

/// Normalize a link for identity comparison.
///
/// Lowercases scheme and host, drops the default port and the fragment, and
/// strips a trailing slash from the path. Unparseable links are only trimmed.
pub fn normalize_link(link: &str) -> String {
    let trimmed = link.trim();
    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return trimmed.to_string(),
    };

    // Url::parse already lowercases scheme and host and elides default ports
    url.set_fragment(None);

    let mut normalized = url.to_string();
    if url.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    } else if url.query().is_some() {
        let path = url.path();
        if path.len() > 1 && path.ends_with('/') {
            let stripped = path.trim_end_matches('/').to_string();
            url.set_path(&stripped);
            normalized = url.to_string();
        }
    }
    normalized
}

fn fingerprint(entry: &RawEntry) -> String {
    let title = entry.title.as_deref().unwrap_or("").trim();
    let second = match entry.published {
        Some(ts) => ts.timestamp().to_string(),
        None => summary_prefix(entry.summary.as_deref().unwrap_or("")),
    };

    let input = format!("{}|{}", title, second);
    let hash = Sha256::digest(input.as_bytes());
    format!("sha256:{:x}", hash)
}

/// Whitespace-collapsed, lowercased prefix of the summary.
fn summary_prefix(summary: &str) -> String {
    summary
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(SUMMARY_PREFIX_CHARS)
        .collect()
}
