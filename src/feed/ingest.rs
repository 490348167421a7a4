use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use super::dedup::{age_cutoff, filter_new, DEFAULT_MAX_AGE_DAYS};
use super::fetcher::{FailureKind, FeedFetcher, FetchError};
use super::normalize::{normalize_at, site_url};
use super::parser::{parse_document, FeedDocument, ParseError};
use crate::storage::{
    Database, DatabaseError, DateSource, Feed, FeedUpdate, InsertError, NewArticle,
};
use crate::util::{favicon_url, validate_url, UrlValidationError};

// ============================================================================
// Errors and Outcomes
// ============================================================================

/// Why a feed's document could not be obtained. Recovered per feed.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SourceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::Fetch(e) => e.kind(),
            SourceError::Parse(_) => FailureKind::Malformed,
        }
    }
}

/// Failures that are not about the feed's content: these reach the caller.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),
    #[error("Feed {0} not found")]
    FeedNotFound(i64),
    #[error("Feed {0} was removed while it was being updated")]
    FeedVanished(i64),
    #[error("Feed {0} is already being updated")]
    Busy(i64),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result of polling one feed.
#[derive(Debug)]
pub enum IngestOutcome {
    Succeeded { inserted: usize },
    /// The batch insert hit a URL owned by another feed; articles were then
    /// inserted one at a time and the conflicting ones skipped.
    PartiallyRecovered { inserted: usize, skipped: usize },
    /// The document could not be fetched or parsed. Recorded on the feed.
    Failed(SourceError),
    /// Another worker was already polling this feed.
    Skipped,
}

impl IngestOutcome {
    pub fn inserted(&self) -> usize {
        match self {
            IngestOutcome::Succeeded { inserted }
            | IngestOutcome::PartiallyRecovered { inserted, .. } => *inserted,
            IngestOutcome::Failed(_) | IngestOutcome::Skipped => 0,
        }
    }
}

/// Per-feed poll states, reported to the optional event observer.
///
/// A poll starts in `Idle` and ends in one of the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Idle,
    Fetching,
    Parsing,
    Deduplicating,
    Persisting,
    Succeeded,
    PartiallyRecovered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestEvent {
    pub feed_id: i64,
    pub state: FeedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Succeeded,
    PartiallyRecovered,
    Failed,
    Skipped,
}

/// One feed's line in an [`UpdateSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub status: FeedStatus,
    pub inserted: usize,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

/// Totals for an update-all run. `succeeded` includes partial recoveries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub inserted: usize,
    pub reports: Vec<FeedReport>,
}

/// Result of [`Ingestor::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub feed: Feed,
    /// `false` when the URL was already subscribed
    pub created: bool,
    /// Initial ingest of a new feed
    pub outcome: Option<IngestOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub articles: u64,
    pub tombstones: u64,
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Age window for newly ingested articles
    pub max_age: Duration,
    /// Feeds polled at once by [`Ingestor::update_all_feeds`]
    pub concurrency: usize,
    /// Accept subscriptions to localhost and private networks
    pub allow_private_hosts: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
            concurrency: 4,
            allow_private_hosts: false,
        }
    }
}

/// Retention policy for [`Ingestor::prune`]. `None` keeps forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retention {
    pub articles: Option<Duration>,
    pub tombstones: Option<Duration>,
}

// ============================================================================
// Ingestor
// ============================================================================

type InFlight = Arc<Mutex<HashSet<i64>>>;

/// Marks a feed as being polled until dropped.
struct InFlightGuard {
    in_flight: InFlight,
    feed_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.feed_id);
    }
}

/// Drives fetch → parse → normalize → dedup → persist for feeds.
///
/// Clones share the same in-flight set, so no two clones poll the same feed
/// at once.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    fetcher: FeedFetcher,
    options: IngestOptions,
    in_flight: InFlight,
    events: Option<mpsc::Sender<IngestEvent>>,
}

impl Ingestor {
    pub fn new(db: Database, fetcher: FeedFetcher, options: IngestOptions) -> Self {
        Self {
            db,
            fetcher,
            options,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            events: None,
        }
    }

    /// Report per-feed state transitions on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<IngestEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn emit(&self, feed_id: i64, state: FeedState) {
        tracing::trace!(feed_id = feed_id, state = ?state, "Feed state");
        if let Some(tx) = &self.events {
            // A dropped observer must not affect ingestion
            let _ = tx.send(IngestEvent { feed_id, state }).await;
        }
    }

    fn claim(&self, feed_id: i64) -> Option<InFlightGuard> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(feed_id) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            feed_id,
        })
    }

    async fn fetch_document(&self, url: &str) -> Result<FeedDocument, SourceError> {
        let fetched = self.fetcher.fetch(url).await?;
        Ok(parse_document(&fetched.bytes)?)
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Poll one feed by ID.
    pub async fn update_feed(&self, feed_id: i64) -> Result<IngestOutcome, IngestError> {
        let feed = self
            .db
            .get_feed(feed_id)
            .await?
            .ok_or(IngestError::FeedNotFound(feed_id))?;
        self.update_one_feed(&feed).await
    }

    /// Poll one feed and store its new articles.
    ///
    /// Fetch and parse failures are recorded on the feed and returned as
    /// [`IngestOutcome::Failed`]. Only infrastructure failures, such as the
    /// feed row disappearing mid-update, are returned as errors.
    pub async fn update_one_feed(&self, feed: &Feed) -> Result<IngestOutcome, IngestError> {
        let Some(_guard) = self.claim(feed.id) else {
            tracing::info!(
                feed_id = feed.id,
                title = %feed.title,
                "Feed is already being updated, skipping"
            );
            return Ok(IngestOutcome::Skipped);
        };

        self.emit(feed.id, FeedState::Fetching).await;
        let fetched = match self.fetcher.fetch(&feed.url).await {
            Ok(fetched) => fetched,
            Err(e) => return self.record_failure(feed, e.into()).await,
        };

        self.emit(feed.id, FeedState::Parsing).await;
        let doc = match parse_document(&fetched.bytes) {
            Ok(doc) => doc,
            Err(e) => return self.record_failure(feed, e.into()).await,
        };

        let result = self.ingest_document(feed, &doc, Utc::now()).await;
        if let Err(e) = &result {
            tracing::error!(
                feed_id = feed.id,
                title = %feed.title,
                url = %feed.url,
                error = %e,
                "Feed update failed"
            );
            self.emit(feed.id, FeedState::Failed).await;
        }
        result
    }

    async fn record_failure(
        &self,
        feed: &Feed,
        error: SourceError,
    ) -> Result<IngestOutcome, IngestError> {
        tracing::warn!(
            feed_id = feed.id,
            title = %feed.title,
            url = %feed.url,
            kind = ?error.kind(),
            error = %error,
            "Feed fetch failed"
        );

        // Shutdown is not the feed's fault
        if error.kind() != FailureKind::Cancelled {
            if let Err(db_err) = self.db.set_feed_error(feed.id, Some(&error.to_string())).await {
                tracing::warn!(
                    feed_id = feed.id,
                    error = %db_err,
                    "Failed to record feed error"
                );
            }
        }

        self.emit(feed.id, FeedState::Failed).await;
        Ok(IngestOutcome::Failed(error))
    }

    /// Dedup and persist an already parsed document. Caller holds the feed's
    /// in-flight claim.
    async fn ingest_document(
        &self,
        feed: &Feed,
        doc: &FeedDocument,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        self.emit(feed.id, FeedState::Deduplicating).await;

        let candidates: Vec<NewArticle> = doc
            .items
            .iter()
            .map(|item| normalize_at(feed.id, &feed.url, item, now))
            .collect();
        let candidate_count = candidates.len();

        let existing = self.db.load_article_urls(feed.id).await?;
        let tombstones = self.db.load_tombstone_urls().await?;
        let dedup = filter_new(
            candidates,
            &existing,
            &tombstones,
            age_cutoff(now, self.options.max_age),
        );

        tracing::debug!(
            feed_id = feed.id,
            candidates = candidate_count,
            accepted = dedup.accepted.len(),
            existing = dedup.existing,
            tombstoned = dedup.tombstoned,
            too_old = dedup.too_old,
            duplicate_in_batch = dedup.duplicate_in_batch,
            "Deduplicated feed items"
        );

        self.emit(feed.id, FeedState::Persisting).await;
        let update = feed_update(doc, &feed.url, now);

        match self
            .db
            .insert_articles_batch(feed.id, &dedup.accepted, &update)
            .await
        {
            Ok(inserted) => {
                tracing::info!(
                    feed_id = feed.id,
                    title = %feed.title,
                    inserted = inserted,
                    "Feed updated"
                );
                self.emit(feed.id, FeedState::Succeeded).await;
                Ok(IngestOutcome::Succeeded { inserted })
            }
            Err(InsertError::UniqueViolation(detail)) => {
                tracing::warn!(
                    feed_id = feed.id,
                    title = %feed.title,
                    detail = %detail,
                    "Batch insert hit an article stored by another feed, inserting individually"
                );
                self.recover(feed.id, &dedup.accepted, &update).await
            }
            Err(InsertError::Database(DatabaseError::FeedMissing(id))) => {
                Err(IngestError::FeedVanished(id))
            }
            Err(InsertError::Database(e)) => Err(e.into()),
        }
    }

    /// Insert articles one at a time after a batch conflict, skipping any URL
    /// another feed owns. Each failure skips only the article that caused it.
    async fn recover(
        &self,
        feed_id: i64,
        articles: &[NewArticle],
        update: &FeedUpdate,
    ) -> Result<IngestOutcome, IngestError> {
        // The failed batch was rolled back; start again from the stored feed
        let feed = self.reload_feed(feed_id).await?;

        let mut inserted = 0;
        let mut skipped = 0;
        for article in articles {
            match self.db.url_exists_globally(&article.url).await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(
                        feed_id = feed_id,
                        url = %article.url,
                        "Article already stored by another feed, skipping"
                    );
                    skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        feed_id = feed_id,
                        url = %article.url,
                        error = %e,
                        "Could not check article URL, skipping"
                    );
                    skipped += 1;
                    continue;
                }
            }

            match self.db.insert_article(article).await {
                Ok(_) => inserted += 1,
                Err(InsertError::UniqueViolation(_)) => {
                    tracing::debug!(
                        feed_id = feed_id,
                        url = %article.url,
                        "Article stored concurrently by another feed, skipping"
                    );
                    skipped += 1;
                }
                Err(InsertError::Database(e)) => {
                    tracing::warn!(
                        feed_id = feed_id,
                        url = %article.url,
                        error = %e,
                        "Article insert failed, skipping"
                    );
                    skipped += 1;
                    self.reload_feed(feed_id).await?;
                }
            }
        }

        match self.db.update_feed_metadata(feed_id, update).await {
            Ok(()) => {}
            Err(DatabaseError::FeedMissing(id)) => return Err(IngestError::FeedVanished(id)),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            feed_id = feed_id,
            title = %feed.title,
            inserted = inserted,
            skipped = skipped,
            "Feed updated after conflict recovery"
        );
        self.emit(feed_id, FeedState::PartiallyRecovered).await;
        Ok(IngestOutcome::PartiallyRecovered { inserted, skipped })
    }

    async fn reload_feed(&self, feed_id: i64) -> Result<Feed, IngestError> {
        match self.db.get_feed(feed_id).await? {
            Some(feed) => Ok(feed),
            None => {
                tracing::error!(feed_id = feed_id, "Feed disappeared during update");
                Err(IngestError::FeedVanished(feed_id))
            }
        }
    }

    /// Poll every active feed, at most `concurrency` at a time.
    ///
    /// A feed's failure, of any kind, is reported in the summary and never
    /// stops the others. Feeds not yet started when shutdown is requested are
    /// reported as skipped.
    pub async fn update_all_feeds(&self) -> Result<UpdateSummary, IngestError> {
        let feeds = self.db.load_active_feeds().await?;
        if feeds.is_empty() {
            tracing::info!("No active feeds to update");
            return Ok(UpdateSummary::default());
        }

        let total = feeds.len();
        tracing::info!(total = total, "Updating all feeds");

        let reports: Vec<FeedReport> = stream::iter(feeds)
            .map(|feed| async move { self.report_for(feed).await })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut summary = UpdateSummary {
            total,
            ..Default::default()
        };
        for report in &reports {
            match report.status {
                FeedStatus::Succeeded | FeedStatus::PartiallyRecovered => summary.succeeded += 1,
                FeedStatus::Failed => summary.failed += 1,
                FeedStatus::Skipped => summary.skipped += 1,
            }
            summary.inserted += report.inserted;
        }
        summary.reports = reports;

        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            total = summary.total,
            inserted = summary.inserted,
            "Feed update finished"
        );
        Ok(summary)
    }

    async fn report_for(&self, feed: Feed) -> FeedReport {
        let mut report = FeedReport {
            feed_id: feed.id,
            title: feed.title.clone(),
            url: feed.url.clone(),
            status: FeedStatus::Skipped,
            inserted: 0,
            failure: None,
            message: None,
        };

        if self.fetcher.shutdown().is_triggered() {
            report.failure = Some(FailureKind::Cancelled);
            return report;
        }

        match self.update_one_feed(&feed).await {
            Ok(IngestOutcome::Succeeded { inserted }) => {
                report.status = FeedStatus::Succeeded;
                report.inserted = inserted;
            }
            Ok(IngestOutcome::PartiallyRecovered { inserted, .. }) => {
                report.status = FeedStatus::PartiallyRecovered;
                report.inserted = inserted;
            }
            Ok(IngestOutcome::Failed(e)) => {
                report.status = FeedStatus::Failed;
                report.failure = Some(e.kind());
                report.message = Some(e.to_string());
            }
            Ok(IngestOutcome::Skipped) => {}
            Err(e) => {
                // Already logged with feed context by update_one_feed
                report.status = FeedStatus::Failed;
                report.failure = Some(FailureKind::Infra);
                report.message = Some(e.to_string());
            }
        }
        report
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Re-fetch a feed and correct `published_at` on stored articles whose
    /// freshly resolved date differs. Items with no discoverable date are
    /// ignored rather than stamped with the current time.
    ///
    /// Returns the number of articles changed.
    pub async fn resync_article_dates(&self, feed_id: i64) -> Result<usize, IngestError> {
        let feed = self
            .db
            .get_feed(feed_id)
            .await?
            .ok_or(IngestError::FeedNotFound(feed_id))?;
        let _guard = self.claim(feed.id).ok_or(IngestError::Busy(feed.id))?;

        let doc = self.fetch_document(&feed.url).await?;
        let now = Utc::now();

        let mut fresh: HashMap<String, i64> = HashMap::new();
        for item in &doc.items {
            let article = normalize_at(feed.id, &feed.url, item, now);
            if article.date_source != DateSource::Fallback {
                fresh
                    .entry(article.url)
                    .or_insert(article.published_at.timestamp());
            }
        }

        let updates: Vec<(i64, i64)> = self
            .db
            .get_articles_for_feed(feed.id)
            .await?
            .into_iter()
            .filter_map(|stored| match fresh.get(&stored.url) {
                Some(&published) if published != stored.published_at => {
                    Some((stored.id, published))
                }
                _ => None,
            })
            .collect();

        let changed = self.db.update_published_dates(&updates).await?;
        tracing::info!(
            feed_id = feed.id,
            title = %feed.title,
            changed = changed,
            "Resynced article dates"
        );
        Ok(changed)
    }

    fn check_url(&self, url: &str) -> Result<Url, UrlValidationError> {
        match validate_url(url) {
            Err(UrlValidationError::Localhost | UrlValidationError::PrivateIp(_))
                if self.options.allow_private_hosts =>
            {
                Ok(Url::parse(url.trim())?)
            }
            other => other,
        }
    }

    /// Subscribe to a feed URL.
    ///
    /// An already subscribed URL returns the stored feed untouched. Otherwise
    /// the document is fetched and parsed first, so an unreachable or invalid
    /// feed is never created; the new feed then gets its metadata and first
    /// articles through the normal dedup and persist path.
    pub async fn subscribe(&self, url: &str) -> Result<Subscription, IngestError> {
        let url = self.check_url(url)?.to_string();

        if let Some(feed) = self.db.get_feed_by_url(&url).await? {
            tracing::info!(feed_id = feed.id, url = %url, "Already subscribed");
            return Ok(Subscription {
                feed,
                created: false,
                outcome: None,
            });
        }

        let doc = self.fetch_document(&url).await?;
        let title = doc.title.clone().unwrap_or_else(|| url.clone());
        let feed_id = self.db.insert_feed(&url, &title).await?;
        let feed = self.reload_feed(feed_id).await?;

        let outcome = match self.claim(feed_id) {
            Some(_guard) => self.ingest_document(&feed, &doc, Utc::now()).await?,
            None => IngestOutcome::Skipped,
        };
        let feed = self.reload_feed(feed_id).await?;

        tracing::info!(
            feed_id = feed.id,
            title = %feed.title,
            inserted = outcome.inserted(),
            "Subscribed to feed"
        );
        Ok(Subscription {
            feed,
            created: true,
            outcome: Some(outcome),
        })
    }

    /// Apply the retention policy. Deleted articles leave tombstones.
    pub async fn prune(&self, retention: &Retention) -> Result<PruneReport, IngestError> {
        let now = Utc::now();
        let mut report = PruneReport::default();

        if let Some(max_age) = retention.articles {
            report.articles = self
                .db
                .prune_articles_published_before((now - max_age).timestamp())
                .await?;
        }
        if let Some(max_age) = retention.tombstones {
            report.tombstones = self
                .db
                .prune_tombstones_before((now - max_age).timestamp())
                .await?;
        }

        tracing::info!(
            articles = report.articles,
            tombstones = report.tombstones,
            "Pruned old articles"
        );
        Ok(report)
    }
}

/// Metadata written at the end of a successful poll.
fn feed_update(doc: &FeedDocument, feed_url: &str, now: DateTime<Utc>) -> FeedUpdate {
    let site = site_url(doc, feed_url);
    FeedUpdate {
        last_fetched_at: now.timestamp(),
        title: doc.title.clone(),
        description: doc.description.clone(),
        favicon_url: site.as_deref().and_then(favicon_url),
        site_url: site,
    }
}
