use chrono::{DateTime, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock past the busy timeout
    #[error("The database is locked by another process. Please close it and try again.")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The feed row disappeared while it was being updated
    #[error("Feed {0} no longer exists")]
    FeedMissing(i64),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

/// Outcome of an article insert that failed.
///
/// A uniqueness conflict is separated from every other failure so the
/// ingestion coordinator can branch into conflict recovery instead of
/// treating it as an infrastructure fault.
#[derive(Debug, Error)]
pub enum InsertError {
    /// The write collided with the global article URL uniqueness constraint.
    #[error("Article URL already stored: {0}")]
    UniqueViolation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for InsertError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return InsertError::UniqueViolation(db_err.message().to_string());
            }
        }
        InsertError::Database(DatabaseError::from_sqlx(err))
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed RSS/Atom source.
///
/// Timestamps are Unix seconds, UTC.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub favicon_url: Option<String>,
    pub is_active: bool,
    pub last_fetched_at: Option<i64>,
    /// Actionable message from the most recent failed poll, cleared on success
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// An ingested item, unique by `url` across every feed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published_at: i64,
    pub created_at: i64,
}

/// Marker left behind when an article is deleted, so the next poll does not
/// bring the same URL back.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeletedArticle {
    pub id: i64,
    pub url: String,
    pub deleted_at: i64,
}

/// Where an article's publish date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSource {
    /// A date field the feed parser already understood
    Structured,
    /// A raw date string parsed leniently
    RawString,
    /// An `updated`/`published` element found in the item's element tree
    ElementTree,
    /// Nothing usable was found; the article is stamped with processing time
    Fallback,
}

/// A normalized article ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub feed_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub date_source: DateSource,
}

/// Metadata written to a feed row at the end of a poll.
///
/// `last_fetched_at` always overwrites; the optional fields only fill in
/// values the feed does not have yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedUpdate {
    pub last_fetched_at: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub favicon_url: Option<String>,
}

impl FeedUpdate {
    /// An update that only records the fetch time.
    pub fn fetched_at(timestamp: i64) -> Self {
        Self {
            last_fetched_at: timestamp,
            ..Default::default()
        }
    }
}
