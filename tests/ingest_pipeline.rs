//! Integration tests for the ingestion pipeline: fetch, parse, normalize,
//! deduplicate and persist, against a mock HTTP server.
//!
//! Each test creates its own database. The cross-feed concurrency test uses
//! a file-backed database so several pool connections really do race.

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use briefed::feed::{
    build_http_client, FailureKind, FeedFetcher, FeedStatus, HttpSettings, IngestOptions,
    IngestOutcome, Ingestor, RetryPolicy,
};
use briefed::storage::{Database, Feed};
use briefed::util::Shutdown;

// ============================================================================
// Helpers
// ============================================================================

struct Item<'a> {
    url: &'a str,
    published: DateTime<Utc>,
    description: &'a str,
}

fn item(url: &str, published: DateTime<Utc>) -> Item<'_> {
    Item {
        url,
        published,
        description: "Summary",
    }
}

fn rss(title: &str, items: &[Item<'_>]) -> String {
    let mut body = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
<title>{title}</title><link>https://site.example/</link><description>Test</description>"#
    );
    for item in items {
        body.push_str(&format!(
            "<item><title>{}</title><link>{}</link><description>{}</description><pubDate>{}</pubDate></item>\n",
            item.url,
            item.url,
            html_escape::encode_text(item.description),
            item.published.to_rfc2822()
        ));
    }
    body.push_str("</channel></rss>");
    body
}

fn ingestor(db: &Database, concurrency: usize) -> Ingestor {
    let fetcher = FeedFetcher::new(
        build_http_client(&HttpSettings::default()).unwrap(),
        RetryPolicy {
            max_attempts: 2,
            backoff: std::time::Duration::from_millis(10),
        },
        Shutdown::never(),
    );
    Ingestor::new(
        db.clone(),
        fetcher,
        IngestOptions {
            concurrency,
            allow_private_hosts: true,
            ..Default::default()
        },
    )
}

async fn serve(mock_server: &MockServer, route: &str, status: u16, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(mock_server)
        .await;
}

async fn add_feed(db: &Database, mock_server: &MockServer, route: &str, title: &str) -> Feed {
    let id = db
        .insert_feed(&format!("{}{}", mock_server.uri(), route), title)
        .await
        .unwrap();
    db.get_feed(id).await.unwrap().unwrap()
}

async fn urls_for(db: &Database, feed_id: i64) -> HashSet<String> {
    db.load_article_urls(feed_id).await.unwrap()
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_second_poll_of_unchanged_feed_inserts_nothing() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    serve(
        &mock_server,
        "/feed",
        200,
        rss(
            "Stable",
            &[
                item("https://site.example/a", now - Duration::hours(1)),
                item("https://site.example/b", now - Duration::days(3)),
            ],
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let feed = add_feed(&db, &mock_server, "/feed", "Stable").await;
    let ingestor = ingestor(&db, 4);

    let first = ingestor.update_one_feed(&feed).await.unwrap();
    let second = ingestor.update_one_feed(&feed).await.unwrap();

    assert_eq!(first.inserted(), 2);
    assert!(
        matches!(second, IngestOutcome::Succeeded { inserted: 0 }),
        "{second:?}"
    );
    assert_eq!(db.count_articles().await.unwrap(), 2);
}

#[tokio::test]
async fn test_deleted_article_is_never_recreated() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    serve(
        &mock_server,
        "/feed",
        200,
        rss(
            "Tombstones",
            &[
                item("https://site.example/keep", now),
                item("https://site.example/deleted", now),
            ],
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let feed = add_feed(&db, &mock_server, "/feed", "Tombstones").await;
    let ingestor = ingestor(&db, 4);
    ingestor.update_one_feed(&feed).await.unwrap();

    let doomed = db
        .get_article_by_url("https://site.example/deleted")
        .await
        .unwrap()
        .unwrap();
    assert!(db.delete_article(doomed.id).await.unwrap());

    for _ in 0..2 {
        let outcome = ingestor.update_one_feed(&feed).await.unwrap();
        assert_eq!(outcome.inserted(), 0);
    }
    assert!(db
        .get_article_by_url("https://site.example/deleted")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        urls_for(&db, feed.id).await,
        HashSet::from(["https://site.example/keep".to_string()])
    );
}

#[tokio::test]
async fn test_age_window_excludes_old_items() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    serve(
        &mock_server,
        "/feed",
        200,
        rss(
            "Ages",
            &[
                item("https://site.example/old", now - Duration::days(20)),
                item("https://site.example/recent", now - Duration::days(2)),
            ],
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let feed = add_feed(&db, &mock_server, "/feed", "Ages").await;
    ingestor(&db, 4).update_one_feed(&feed).await.unwrap();

    let articles = db.get_articles_for_feed(feed.id).await.unwrap();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].url, "https://site.example/recent");
    let cutoff = (Utc::now() - Duration::days(14)).timestamp();
    assert!(articles.iter().all(|a| a.published_at >= cutoff));
}

#[tokio::test]
async fn test_shared_url_in_same_cycle_creates_one_article() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    serve(
        &mock_server,
        "/one",
        200,
        rss(
            "One",
            &[
                item("https://news.example/shared", now),
                item("https://one.example/own", now),
            ],
        ),
    )
    .await;
    serve(
        &mock_server,
        "/two",
        200,
        rss(
            "Two",
            &[
                item("https://news.example/shared", now),
                item("https://two.example/own", now),
            ],
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let one = add_feed(&db, &mock_server, "/one", "One").await;
    let two = add_feed(&db, &mock_server, "/two", "Two").await;

    let summary = ingestor(&db, 1).update_all_feeds().await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.inserted, 3);
    assert!(summary
        .reports
        .iter()
        .any(|r| r.status == FeedStatus::PartiallyRecovered));

    assert_eq!(db.count_articles().await.unwrap(), 3);
    assert!(urls_for(&db, one.id).await.contains("https://one.example/own"));
    assert!(urls_for(&db, two.id).await.contains("https://two.example/own"));
}

#[tokio::test]
async fn test_concurrent_feeds_never_duplicate_urls() {
    let mock_server = MockServer::start().await;
    let now = Utc::now();
    let shared: Vec<String> = (0..20)
        .map(|i| format!("https://wire.example/story-{}", i))
        .collect();

    let mut expected: HashSet<String> = shared.iter().cloned().collect();
    for name in ["alpha", "beta", "gamma"] {
        let own: Vec<String> = (0..5)
            .map(|i| format!("https://{}.example/post-{}", name, i))
            .collect();
        expected.extend(own.iter().cloned());

        let items: Vec<Item<'_>> = shared
            .iter()
            .chain(own.iter())
            .map(|url| item(url, now))
            .collect();
        serve(&mock_server, &format!("/{}", name), 200, rss(name, &items)).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("briefed.db");
    let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
    let mut feeds = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        feeds.push(add_feed(&db, &mock_server, &format!("/{}", name), name).await);
    }

    let summary = ingestor(&db, 3).update_all_feeds().await.unwrap();
    assert_eq!(summary.failed, 0, "{:?}", summary.reports);
    assert_eq!(summary.inserted, expected.len());

    let mut stored: Vec<String> = Vec::new();
    for feed in &feeds {
        stored.extend(
            db.get_articles_for_feed(feed.id)
                .await
                .unwrap()
                .into_iter()
                .map(|a| a.url),
        );
    }
    let unique: HashSet<String> = stored.iter().cloned().collect();
    assert_eq!(stored.len(), unique.len());
    assert_eq!(unique, expected);

    // Every feed keeps its own articles regardless of who won the shared ones
    for feed in &feeds {
        let own = urls_for(&db, feed.id).await;
        let prefix = format!("https://{}.example/", feed.title);
        assert_eq!(own.iter().filter(|u| u.starts_with(&prefix)).count(), 5);
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_lowercase_doctype_before_rss_still_ingests() {
    let mock_server = MockServer::start().await;
    let body = rss("Doctype", &[item("https://site.example/doc", Utc::now())]);
    let body = body.replacen(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        "<!doctype html>",
        1,
    );
    serve(&mock_server, "/feed", 200, body).await;

    let db = Database::open(":memory:").await.unwrap();
    let feed = add_feed(&db, &mock_server, "/feed", "Doctype").await;
    let outcome = ingestor(&db, 4).update_one_feed(&feed).await.unwrap();

    assert!(
        matches!(outcome, IngestOutcome::Succeeded { inserted: 1 }),
        "{outcome:?}"
    );
}

#[tokio::test]
async fn test_not_found_feed_fails_and_others_continue() {
    let mock_server = MockServer::start().await;
    serve(&mock_server, "/missing", 404, String::new()).await;
    serve(
        &mock_server,
        "/fine",
        200,
        rss("Fine", &[item("https://fine.example/1", Utc::now())]),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let missing = add_feed(&db, &mock_server, "/missing", "Missing").await;
    let fine = add_feed(&db, &mock_server, "/fine", "Fine").await;

    let summary = ingestor(&db, 1).update_all_feeds().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let report = summary
        .reports
        .iter()
        .find(|r| r.feed_id == missing.id)
        .unwrap();
    assert_eq!(report.status, FeedStatus::Failed);
    assert_eq!(report.failure, Some(FailureKind::NotFound));
    assert!(report.message.as_deref().unwrap().contains("not found"));

    assert_eq!(urls_for(&db, fine.id).await.len(), 1);
    let stored = db.get_feed(missing.id).await.unwrap().unwrap();
    assert!(stored.last_error.unwrap().contains("404"));
}

#[tokio::test]
async fn test_html_description_is_reduced_to_text() {
    let mock_server = MockServer::start().await;
    serve(
        &mock_server,
        "/feed",
        200,
        rss(
            "Markup",
            &[Item {
                url: "https://site.example/markup",
                published: Utc::now(),
                description: "<p>A &amp; B<br></p>",
            }],
        ),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let feed = add_feed(&db, &mock_server, "/feed", "Markup").await;
    ingestor(&db, 4).update_one_feed(&feed).await.unwrap();

    let article = db
        .get_article_by_url("https://site.example/markup")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(article.description.as_deref(), Some("A & B"));
}

#[tokio::test]
async fn test_subscribe_then_update_finds_nothing_new() {
    let mock_server = MockServer::start().await;
    serve(
        &mock_server,
        "/feed",
        200,
        rss("Subscribed", &[item("https://site.example/s1", Utc::now())]),
    )
    .await;

    let db = Database::open(":memory:").await.unwrap();
    let ingestor = ingestor(&db, 4);
    let url = format!("{}/feed", mock_server.uri());

    let subscription = ingestor.subscribe(&url).await.unwrap();
    assert!(subscription.created);
    assert_eq!(subscription.feed.title, "Subscribed");
    assert_eq!(
        subscription.feed.favicon_url.as_deref(),
        Some("https://site.example/favicon.ico")
    );
    assert_eq!(subscription.outcome.map(|o| o.inserted()), Some(1));

    let outcome = ingestor.update_feed(subscription.feed.id).await.unwrap();
    assert_eq!(outcome.inserted(), 0);
}

#[tokio::test]
async fn test_resync_corrects_dates_after_feed_edits_them() {
    let mock_server = MockServer::start().await;
    let original = Utc::now() - Duration::days(1);
    let corrected = Utc::now() - Duration::days(3);

    let db = Database::open(":memory:").await.unwrap();
    let feed = add_feed(&db, &mock_server, "/feed", "Dates").await;
    let ingestor = ingestor(&db, 4);

    serve(
        &mock_server,
        "/feed",
        200,
        rss("Dates", &[item("https://site.example/d", original)]),
    )
    .await;
    ingestor.update_one_feed(&feed).await.unwrap();

    mock_server.reset().await;
    serve(
        &mock_server,
        "/feed",
        200,
        rss("Dates", &[item("https://site.example/d", corrected)]),
    )
    .await;

    assert_eq!(ingestor.resync_article_dates(feed.id).await.unwrap(), 1);
    let article = db
        .get_article_by_url("https://site.example/d")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(article.published_at, corrected.timestamp());
    assert_eq!(ingestor.resync_article_dates(feed.id).await.unwrap(), 0);
}
