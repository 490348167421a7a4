//! The feed ingestion pipeline.
//!
//! - [`fetcher`] - HTTP retrieval with retry, redirect limits and content sniffing
//! - [`parser`] - XML repair and RSS/Atom/JSON Feed parsing via `feed-rs`
//! - [`raw`] - generic element trees for each item, used for date and image fallbacks
//! - [`normalize`] - raw items to storable articles (HTML stripping, date resolution)
//! - [`dedup`] - pure new-article selection against stored URLs and tombstones
//! - [`ingest`] - the [`Ingestor`] that runs the above per feed and for all feeds
//!
//! # Example
//!
//! ```ignore
//! let fetcher = FeedFetcher::new(build_http_client(&HttpSettings::default())?, RetryPolicy::default(), shutdown);
//! let ingestor = Ingestor::new(db, fetcher, IngestOptions::default());
//! let summary = ingestor.update_all_feeds().await?;
//! ```

pub mod dedup;
pub mod fetcher;
pub mod ingest;
pub mod normalize;
pub mod parser;
pub mod raw;

pub use dedup::{filter_new, DedupOutcome};
pub use fetcher::{
    build_http_client, FailureKind, FeedFetcher, FetchError, FetchedFeed, HttpSettings,
    RetryPolicy,
};
pub use ingest::{
    FeedReport, FeedState, FeedStatus, IngestError, IngestEvent, IngestOptions, IngestOutcome,
    Ingestor, PruneReport, Retention, SourceError, Subscription, UpdateSummary,
};
pub use normalize::normalize;
pub use parser::{parse_document, FeedDocument, FeedFormat, ParseError, RawItem};
