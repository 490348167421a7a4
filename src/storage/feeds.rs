use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedUpdate};
use crate::util::favicon_url;

const FEED_COLUMNS: &str = "id, url, title, description, site_url, favicon_url, is_active, \
                            last_fetched_at, last_error, created_at";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a feed URL, returning the feed ID.
    ///
    /// Subscribing to a URL that is already stored returns the existing ID
    /// without touching the stored row.
    pub async fn insert_feed(&self, url: &str, title: &str) -> Result<i64, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (url, title, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET url = excluded.url
            RETURNING id
        "#,
        )
        .bind(url)
        .bind(title)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Get a feed by ID, or `None` if it does not exist.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {} FROM feeds WHERE id = ?",
            FEED_COLUMNS
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// Get a feed by its (unique) URL.
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {} FROM feeds WHERE url = ?",
            FEED_COLUMNS
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// All feeds the poller should visit, ordered by title.
    pub async fn load_active_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {} FROM feeds WHERE is_active = 1 ORDER BY title, id",
            FEED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Every feed, active or not, ordered by title.
    pub async fn load_all_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {} FROM feeds ORDER BY title, id",
            FEED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Pause or resume polling for a feed.
    pub async fn set_feed_active(&self, feed_id: i64, active: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE feeds SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::FeedMissing(feed_id));
        }
        Ok(())
    }

    /// Remove a feed and all of its articles.
    ///
    /// Articles are deleted explicitly before the feed so every one of them
    /// leaves a tombstone. Returns the number of articles removed.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let articles = sqlx::query("DELETE FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let feeds = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if feeds == 0 {
            tx.rollback().await?;
            return Err(DatabaseError::FeedMissing(feed_id));
        }

        tx.commit().await?;
        Ok(articles)
    }

    /// Apply end-of-poll metadata to a feed outside of a batch insert.
    ///
    /// Clears `last_error`. Fails with [`DatabaseError::FeedMissing`] if the
    /// row is gone.
    pub async fn update_feed_metadata(
        &self,
        feed_id: i64,
        update: &FeedUpdate,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        apply_feed_update(&mut conn, feed_id, update).await
    }

    /// Record or clear the error message from the latest poll.
    pub async fn set_feed_error(
        &self,
        feed_id: i64,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feeds SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fill in `favicon_url` for active feeds that know their site URL but
    /// have no favicon yet. Returns the number of feeds updated.
    pub async fn backfill_favicons(&self) -> Result<usize, DatabaseError> {
        let candidates: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, site_url FROM feeds
            WHERE is_active = 1
              AND (favicon_url IS NULL OR favicon_url = '')
              AND site_url IS NOT NULL AND site_url != ''
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if candidates.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (feed_id, site_url) in &candidates {
            // Unparseable site URLs are left alone
            let Some(favicon) = favicon_url(site_url) else {
                continue;
            };
            sqlx::query("UPDATE feeds SET favicon_url = ? WHERE id = ?")
                .bind(&favicon)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
            updated += 1;
        }
        tx.commit().await?;

        tracing::info!(count = updated, "Updated feeds with favicon URLs");
        Ok(updated)
    }
}

/// Writes a [`FeedUpdate`] on an existing connection, so the batch insert can
/// run it inside its own transaction.
pub(crate) async fn apply_feed_update(
    conn: &mut sqlx::SqliteConnection,
    feed_id: i64,
    update: &FeedUpdate,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        r#"
        UPDATE feeds SET
            last_fetched_at = ?,
            last_error = NULL,
            title = CASE WHEN title = '' AND ? IS NOT NULL THEN ? ELSE title END,
            description = COALESCE(NULLIF(description, ''), ?),
            site_url = COALESCE(NULLIF(site_url, ''), ?),
            favicon_url = CASE
                WHEN site_url IS NULL OR site_url = '' THEN COALESCE(?, favicon_url)
                ELSE favicon_url
            END
        WHERE id = ?
    "#,
    )
    .bind(update.last_fetched_at)
    .bind(&update.title)
    .bind(&update.title)
    .bind(&update.description)
    .bind(&update.site_url)
    .bind(&update.favicon_url)
    .bind(feed_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::FeedMissing(feed_id));
    }
    Ok(())
}
