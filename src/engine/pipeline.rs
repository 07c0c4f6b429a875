use std::collections::HashSet;
use std::time::Duration;

use crate::feed::{identify, CacheHints, ErrorKind, FetchResponse, Fetcher};
use crate::sink::NewEntry;
use crate::storage::StateStore;

use super::source::Source;

/// Result of one fetch, parse and diff cycle. Failures are values, never panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The source reported no change since the last fetch
    Unchanged,
    /// Entries not yet in the source's seen set, oldest first when every
    /// entry carries a timestamp, otherwise in document order. May be empty.
    NewEntries(Vec<NewEntry>),
    Error(ErrorKind),
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, PollOutcome::Error(_))
    }
}

/// A [`PollOutcome`] plus the bookkeeping the scheduler persists afterwards.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub outcome: PollOutcome,
    /// Validators to hand back on the next fetch
    pub cache_hints: CacheHints,
    /// Identities in the document that were already seen
    pub still_present: Vec<String>,
}

impl PollReport {
    fn failed(kind: ErrorKind, hints: &CacheHints) -> Self {
        Self {
            outcome: PollOutcome::Error(kind),
            cache_hints: hints.clone(),
            still_present: Vec::new(),
        }
    }
}

/// Fetch, parse and diff one source against the state store.
///
/// The fetch is bounded by `timeout` even if the fetcher ignores it.
/// Nothing is written to the store here; the scheduler records entries
/// only after they are delivered.
///
/// # Arguments
///
/// * `source` - Source to poll; its cache hints make the request conditional
/// * `fetcher` - Retrieves and parses the document
/// * `store` - Answers `has_seen` for each candidate identity
/// * `timeout` - Upper bound on the whole fetch
///
/// # Returns
///
/// A [`PollReport`] whose outcome is `Unchanged`, `NewEntries` (oldest
/// first, possibly empty) or `Error`. Fetch failures map to their
/// [`ErrorKind`]; a failed `has_seen` yields `Error(Storage)`. The report
/// also carries the response's cache hints and the identities still
/// present in the document.
pub async fn poll(
    source: &Source,
    fetcher: &dyn Fetcher,
    store: &dyn StateStore,
    timeout: Duration,
) -> PollReport {
    let fetched = tokio::time::timeout(
        timeout,
        fetcher.fetch(&source.url, timeout, &source.cache_hints),
    )
    .await;

    let document = match fetched {
        Err(_) => {
            tracing::debug!(source = %source.id, "Fetch exceeded deadline");
            return PollReport::failed(ErrorKind::Timeout, &source.cache_hints);
        }
        Ok(Err(e)) => {
            tracing::debug!(source = %source.id, error = %e, "Fetch failed");
            return PollReport::failed(e.kind(), &source.cache_hints);
        }
        Ok(Ok(FetchResponse::Unchanged(hints))) => {
            return PollReport {
                outcome: PollOutcome::Unchanged,
                cache_hints: hints,
                still_present: Vec::new(),
            };
        }
        Ok(Ok(FetchResponse::Document(document))) => document,
    };

    let limit = source.max_entries.unwrap_or(usize::MAX);
    let mut in_document = HashSet::new();
    let mut fresh = Vec::new();
    let mut still_present = Vec::new();

    for entry in document.entries.into_iter().take(limit) {
        let identity = identify(&entry, &source.id);
        // Repeats within one document are neither new nor old
        if !in_document.insert(identity.body.clone()) {
            continue;
        }

        match store.has_seen(&identity).await {
            Ok(true) => still_present.push(identity.body),
            Ok(false) => fresh.push(NewEntry { identity, entry }),
            Err(e) => {
                tracing::warn!(source = %source.id, error = %e, "Seen-set lookup failed");
                return PollReport::failed(ErrorKind::Storage, &source.cache_hints);
            }
        }
    }

    if fresh.iter().all(|e| e.entry.published.is_some()) {
        fresh.sort_by_key(|e| e.entry.published);
    }

    PollReport {
        outcome: PollOutcome::NewEntries(fresh),
        cache_hints: document.cache_hints,
        still_present,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedDocument, FetchError, RawEntry};
    use crate::storage::Database;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    struct StaticFetcher(Result<FetchResponse, ErrorKind>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _timeout: Duration,
            _hints: &CacheHints,
        ) -> Result<FetchResponse, FetchError> {
            match &self.0 {
                Ok(response) => Ok(response.clone()),
                Err(ErrorKind::Malformed) => Err(FetchError::Parse("bad".into())),
                Err(ErrorKind::Timeout) => Err(FetchError::Timeout),
                Err(_) => Err(FetchError::HttpStatus(502)),
            }
        }
    }

    struct HangingFetcher;

    #[async_trait]
    impl Fetcher for HangingFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _timeout: Duration,
            _hints: &CacheHints,
        ) -> Result<FetchResponse, FetchError> {
            std::future::pending().await
        }
    }

    fn entry(token: &str, day: Option<u32>) -> RawEntry {
        RawEntry {
            title: Some(token.to_uppercase()),
            token: Some(token.into()),
            published: day.and_then(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).single()),
            ..Default::default()
        }
    }

    fn document(entries: Vec<RawEntry>) -> FetchResponse {
        FetchResponse::Document(FeedDocument {
            title: None,
            entries,
            cache_hints: CacheHints {
                etag: Some("\"v2\"".into()),
                last_modified: None,
            },
        })
    }

    fn source() -> Source {
        Source::new("src", "https://example.com/rss", Duration::from_secs(60), Duration::from_secs(600))
    }

    fn tokens(outcome: &PollOutcome) -> Vec<String> {
        match outcome {
            PollOutcome::NewEntries(list) => list.iter().map(|e| e.identity.body.clone()).collect(),
            other => panic!("Expected NewEntries, got {:?}", other),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_new_entries_sorted_oldest_first() {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = StaticFetcher(Ok(document(vec![
            entry("c", Some(3)),
            entry("a", Some(1)),
            entry("b", Some(2)),
        ])));

        let report = poll(&source(), &fetcher, &db, TIMEOUT).await;
        assert_eq!(tokens(&report.outcome), vec!["a", "b", "c"]);
        assert_eq!(report.cache_hints.etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn test_document_order_when_timestamps_missing() {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = StaticFetcher(Ok(document(vec![
            entry("c", Some(3)),
            entry("a", None),
            entry("b", Some(2)),
        ])));

        let report = poll(&source(), &fetcher, &db, TIMEOUT).await;
        assert_eq!(tokens(&report.outcome), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_seen_entries_are_partitioned_out() {
        let db = Database::open(":memory:").await.unwrap();
        let seen = identify(&entry("a", Some(1)), "src");
        db.mark_seen(&seen, Utc::now()).await.unwrap();

        let fetcher = StaticFetcher(Ok(document(vec![entry("a", Some(1)), entry("b", Some(2))])));
        let report = poll(&source(), &fetcher, &db, TIMEOUT).await;
        assert_eq!(tokens(&report.outcome), vec!["b"]);
        assert_eq!(report.still_present, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicates_within_document_keep_first() {
        let db = Database::open(":memory:").await.unwrap();
        let mut dup = entry("a", Some(5));
        dup.title = Some("second copy".into());
        let fetcher = StaticFetcher(Ok(document(vec![entry("a", Some(1)), dup])));

        let report = poll(&source(), &fetcher, &db, TIMEOUT).await;
        match report.outcome {
            PollOutcome::NewEntries(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].entry.title.as_deref(), Some("A"));
            }
            other => panic!("Expected NewEntries, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_entries_limits_document() {
        let db = Database::open(":memory:").await.unwrap();
        let fetcher = StaticFetcher(Ok(document(vec![
            entry("a", Some(1)),
            entry("b", Some(2)),
            entry("c", Some(3)),
        ])));

        let limited = source().with_max_entries(Some(2));
        let report = poll(&limited, &fetcher, &db, TIMEOUT).await;
        assert_eq!(tokens(&report.outcome), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unchanged_passes_hints_through() {
        let db = Database::open(":memory:").await.unwrap();
        let hints = CacheHints {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        };
        let fetcher = StaticFetcher(Ok(FetchResponse::Unchanged(hints.clone())));

        let report = poll(&source(), &fetcher, &db, TIMEOUT).await;
        assert_eq!(report.outcome, PollOutcome::Unchanged);
        assert_eq!(report.cache_hints, hints);
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let db = Database::open(":memory:").await.unwrap();
        for kind in [ErrorKind::Malformed, ErrorKind::Timeout, ErrorKind::Transport] {
            let report = poll(&source(), &StaticFetcher(Err(kind)), &db, TIMEOUT).await;
            assert_eq!(report.outcome, PollOutcome::Error(kind));
        }
    }

    #[tokio::test]
    async fn test_hanging_fetcher_times_out() {
        let db = Database::open(":memory:").await.unwrap();
        let report = poll(&source(), &HangingFetcher, &db, Duration::from_millis(50)).await;
        assert_eq!(report.outcome, PollOutcome::Error(ErrorKind::Timeout));
    }
}
