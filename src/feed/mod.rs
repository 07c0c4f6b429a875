//! Feed retrieval and entry identity.
//!
//! - [`parser`] - converts RSS/Atom/JSON Feed bytes into a [`FeedDocument`] using `feed-rs`
//! - [`fetcher`] - the [`Fetcher`] collaborator and its HTTP implementation
//! - [`identity`] - derives the per-source [`EntryIdentity`] used for deduplication
//!
//! # Example
//!
//! ```ignore
//! use skimd::feed::{identify, CacheHints, Fetcher, FetchResponse, HttpFetcher};
//!
//! let fetcher = HttpFetcher::new()?;
//! if let FetchResponse::Document(doc) = fetcher.fetch(url, timeout, &CacheHints::default()).await? {
//!     for entry in &doc.entries {
//!         println!("{}", identify(entry, "lwn"));
//!     }
//! }
//! ```

mod fetcher;
mod identity;
mod parser;

pub use fetcher::{CacheHints, ErrorKind, FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use identity::{identify, normalize_link, EntryIdentity};
pub use parser::{parse_feed, FeedDocument, RawEntry};
