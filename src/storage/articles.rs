use sqlx::QueryBuilder;
use std::collections::HashSet;

use super::feeds::apply_feed_update;
use super::schema::Database;
use super::types::{Article, DatabaseError, FeedUpdate, InsertError, NewArticle};

const ARTICLE_COLUMNS: &str =
    "id, feed_id, url, title, description, author, image_url, published_at, created_at";

/// Rows per multi-row INSERT. Eight binds per row keeps each statement well
/// under SQLite's bind parameter limit.
const BATCH_SIZE: usize = 50;

impl Database {
    // ========================================================================
    // Article Reads
    // ========================================================================

    /// URLs of every article currently owned by `feed_id`.
    pub async fn load_article_urls(&self, feed_id: i64) -> Result<HashSet<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT url FROM articles WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    /// Whether any feed already owns an article with this URL.
    pub async fn url_exists_globally(&self, url: &str) -> Result<bool, DatabaseError> {
        let row: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM articles WHERE url = ?)")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// All articles for a feed, newest first.
    pub async fn get_articles_for_feed(&self, feed_id: i64) -> Result<Vec<Article>, DatabaseError> {
        let articles = sqlx::query_as::<_, Article>(&format!(
            "SELECT {} FROM articles WHERE feed_id = ? ORDER BY published_at DESC, id DESC",
            ARTICLE_COLUMNS
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    /// Look up the article stored under a URL, whichever feed owns it.
    pub async fn get_article_by_url(&self, url: &str) -> Result<Option<Article>, DatabaseError> {
        let article = sqlx::query_as::<_, Article>(&format!(
            "SELECT {} FROM articles WHERE url = ?",
            ARTICLE_COLUMNS
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(article)
    }

    /// Total number of stored articles.
    pub async fn count_articles(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // ========================================================================
    // Article Writes
    // ========================================================================

    /// Insert a batch of articles and apply the feed's end-of-poll metadata
    /// in one transaction.
    ///
    /// Either every article is written together with the feed update, or
    /// nothing is. A collision with the global URL constraint is reported as
    /// [`InsertError::UniqueViolation`] after the transaction has been rolled
    /// back, leaving the caller free to retry the articles one by one.
    ///
    /// # Returns
    ///
    /// The number of articles inserted.
    pub async fn insert_articles_batch(
        &self,
        feed_id: i64,
        articles: &[NewArticle],
        update: &FeedUpdate,
    ) -> Result<usize, InsertError> {
        let mut tx = self.pool.begin().await?;

        match write_batch(&mut *tx, feed_id, articles, update).await {
            Ok(inserted) => {
                tx.commit().await?;
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        feed_id = feed_id,
                        error = %rollback_err,
                        "Rollback after failed batch insert also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Insert a single article, returning its ID.
    pub async fn insert_article(&self, article: &NewArticle) -> Result<i64, InsertError> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO articles
                (feed_id, url, title, description, author, image_url, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(article.feed_id)
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.author)
        .bind(&article.image_url)
        .bind(article.published_at.timestamp())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Overwrite `published_at` for the given `(article_id, published_at)`
    /// pairs in one transaction. Returns the number of rows changed.
    pub async fn update_published_dates(
        &self,
        updates: &[(i64, i64)],
    ) -> Result<usize, DatabaseError> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for (article_id, published_at) in updates {
            changed += sqlx::query("UPDATE articles SET published_at = ? WHERE id = ?")
                .bind(published_at)
                .bind(article_id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(changed)
    }

    /// Delete one article. The tombstone trigger records its URL.
    ///
    /// Returns `false` if no article had that ID.
    pub async fn delete_article(&self, article_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM articles WHERE id = ?")
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retention: delete every article published before `cutoff` (Unix
    /// seconds). Each deletion leaves a tombstone. Returns the number removed.
    pub async fn prune_articles_published_before(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM articles WHERE published_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn write_batch(
    conn: &mut sqlx::SqliteConnection,
    feed_id: i64,
    articles: &[NewArticle],
    update: &FeedUpdate,
) -> Result<usize, InsertError> {
    // The feed update goes first: it takes the write lock at the start of the
    // transaction and fails fast if the feed row has vanished.
    apply_feed_update(&mut *conn, feed_id, update).await?;

    let now = chrono::Utc::now().timestamp();
    let mut inserted = 0;

    for chunk in articles.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT INTO articles \
             (feed_id, url, title, description, author, image_url, published_at, created_at) ",
        );

        builder.push_values(chunk, |mut b, article| {
            b.push_bind(feed_id)
                .push_bind(&article.url)
                .push_bind(&article.title)
                .push_bind(&article.description)
                .push_bind(&article.author)
                .push_bind(&article.image_url)
                .push_bind(article.published_at.timestamp())
                .push_bind(now);
        });

        let result = builder.build().execute(&mut *conn).await?;
        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}
