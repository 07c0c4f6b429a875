use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_feed, FeedDocument};

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const USER_AGENT: &str = concat!("skimd/", env!("CARGO_PKG_VERSION"));

/// Coarse failure classes that drive backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The fetch did not finish within its deadline
    Timeout,
    /// Connection, TLS, HTTP status or body transfer failure
    Transport,
    /// The document could not be parsed as a feed
    Malformed,
    /// The state store failed while reconciling the poll
    Storage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while fetching and parsing a feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded its deadline
    #[error("Request timed out")]
    Timeout,
    /// Feed could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::Network(e) if e.is_timeout() => ErrorKind::Timeout,
            FetchError::Parse(_) => ErrorKind::Malformed,
            FetchError::Network(_)
            | FetchError::HttpStatus(_)
            | FetchError::RateLimited(_)
            | FetchError::ResponseTooLarge
            | FetchError::IncompleteResponse { .. } => ErrorKind::Transport,
        }
    }
}

/// Conditional-request validators. Opaque to the engine: stored after each
/// fetch and handed back unchanged on the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHints {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheHints {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// What a successful fetch produced.
#[derive(Debug, Clone)]
pub enum FetchResponse {
    /// The source reports nothing changed since the validators were issued
    Unchanged(CacheHints),
    Document(FeedDocument),
}

/// Retrieves and parses the document behind a source URL.
///
/// Implementations must honour `timeout` and report failures as
/// [`FetchError`] values rather than panicking.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        hints: &CacheHints,
    ) -> Result<FetchResponse, FetchError>;
}

/// HTTP fetcher with conditional requests, bounded retries and a body size cap.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry_base_delay: Duration,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            retry_base_delay: Duration::from_secs(1),
        }
    }

    /// Base delay for 429/5xx/incomplete-body retries (doubled per attempt).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    async fn fetch_inner(&self, url: &str, hints: &CacheHints) -> Result<FetchResponse, FetchError> {
        let mut retry_count = 0;

        let (bytes, new_hints) = loop {
            let mut request = self.client.get(url);
            if let Some(etag) = &hints.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &hints.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
            let response = request.send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::NOT_MODIFIED {
                let fresh = response_hints(&response);
                let merged = if fresh.is_empty() { hints.clone() } else { fresh };
                return Ok(FetchResponse::Unchanged(merged));
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(MAX_RETRIES)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }

                let delay = self.retry_base_delay * 2u32.pow(retry_count);
                tracing::warn!(
                    feed = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server refused request, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            let new_hints = response_hints(&response);
            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => break (bytes, new_hints),
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }

                    let delay = self.retry_base_delay * 2u32.pow(retry_count);
                    tracing::debug!(
                        feed = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        let mut document = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        document.cache_hints = new_hints;
        Ok(FetchResponse::Document(document))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        hints: &CacheHints,
    ) -> Result<FetchResponse, FetchError> {
        tokio::time::timeout(timeout, self.fetch_inner(url, hints))
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}

fn response_hints(response: &reqwest::Response) -> CacheHints {
    let header = |name: reqwest::header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    CacheHints {
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
