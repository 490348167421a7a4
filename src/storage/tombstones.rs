use std::collections::HashSet;

use super::schema::Database;
use super::types::{DatabaseError, DeletedArticle};

impl Database {
    /// Every tombstoned URL. Tombstones are global, not per feed.
    pub async fn load_tombstone_urls(&self) -> Result<HashSet<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT url FROM deleted_articles")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    /// Tombstones, most recent first.
    pub async fn get_tombstones(&self) -> Result<Vec<DeletedArticle>, DatabaseError> {
        let rows = sqlx::query_as::<_, DeletedArticle>(
            "SELECT id, url, deleted_at FROM deleted_articles ORDER BY deleted_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Forget tombstones recorded before `cutoff` (Unix seconds), letting
    /// those URLs be ingested again. Returns the number removed.
    pub async fn prune_tombstones_before(&self, cutoff: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM deleted_articles WHERE deleted_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use pretty_assertions::assert_eq;

    async fn insert_tombstone(db: &Database, url: &str, deleted_at: i64) {
        sqlx::query("INSERT INTO deleted_articles (url, deleted_at) VALUES (?, ?)")
            .bind(url)
            .bind(deleted_at)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_tombstone_urls() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.load_tombstone_urls().await.unwrap().is_empty());

        insert_tombstone(&db, "https://a.example/1", 100).await;
        insert_tombstone(&db, "https://b.example/2", 200).await;

        let urls = db.load_tombstone_urls().await.unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls.contains("https://a.example/1"));

        let rows = db.get_tombstones().await.unwrap();
        assert_eq!(rows[0].url, "https://b.example/2");
        assert_eq!(rows[1].deleted_at, 100);
    }

    #[tokio::test]
    async fn test_prune_tombstones_before() {
        let db = Database::open(":memory:").await.unwrap();
        insert_tombstone(&db, "https://a.example/old", 100).await;
        insert_tombstone(&db, "https://a.example/new", 1_000).await;

        assert_eq!(db.prune_tombstones_before(500).await.unwrap(), 1);

        let urls = db.load_tombstone_urls().await.unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls.contains("https://a.example/new"));
    }

    #[tokio::test]
    async fn test_repeated_deletion_keeps_one_tombstone() {
        let db = Database::open(":memory:").await.unwrap();
        let feed = db.insert_feed("https://a.example/rss", "A").await.unwrap();

        for _ in 0..2 {
            sqlx::query(
                "INSERT INTO articles (feed_id, url, title, published_at, created_at) \
                 VALUES (?, 'https://a.example/x', 'X', 0, 0)",
            )
            .bind(feed)
            .execute(&db.pool)
            .await
            .unwrap();
            sqlx::query("DELETE FROM articles WHERE url = 'https://a.example/x'")
                .execute(&db.pool)
                .await
                .unwrap();
        }

        assert_eq!(db.get_tombstones().await.unwrap().len(), 1);
    }
}
