use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::storage::NewArticle;

/// Articles published longer ago than this are not ingested.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 14;

/// Result of filtering one feed's candidates.
#[derive(Debug, Default, PartialEq)]
pub struct DedupOutcome {
    pub accepted: Vec<NewArticle>,
    /// Already stored for this feed
    pub existing: usize,
    /// Deleted earlier and tombstoned
    pub tombstoned: usize,
    /// Published before the cutoff
    pub too_old: usize,
    /// Repeated within the same document
    pub duplicate_in_batch: usize,
}

impl DedupOutcome {
    pub fn rejected(&self) -> usize {
        self.existing + self.tombstoned + self.too_old + self.duplicate_in_batch
    }
}

/// Oldest publish date still accepted at `now`.
pub fn age_cutoff(now: DateTime<Utc>, max_age: Duration) -> DateTime<Utc> {
    now - max_age
}

/// Decide which candidates are new.
///
/// A candidate is accepted when its URL is neither stored for this feed nor
/// tombstoned, it was published at or after `cutoff`, and no earlier
/// candidate in the same batch had the same URL. Acceptance order follows
/// candidate order.
///
/// Passing this filter does not guarantee the insert succeeds: another feed
/// may own the URL, which only the store's uniqueness constraint can tell.
pub fn filter_new(
    candidates: Vec<NewArticle>,
    existing_urls: &HashSet<String>,
    tombstone_urls: &HashSet<String>,
    cutoff: DateTime<Utc>,
) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(candidates.len());

    for article in candidates {
        if existing_urls.contains(&article.url) {
            outcome.existing += 1;
        } else if tombstone_urls.contains(&article.url) {
            outcome.tombstoned += 1;
        } else if article.published_at < cutoff {
            outcome.too_old += 1;
        } else if !seen.insert(article.url.clone()) {
            outcome.duplicate_in_batch += 1;
        } else {
            outcome.accepted.push(article);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DateSource;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn article(url: &str, days_ago: i64) -> NewArticle {
        NewArticle {
            feed_id: 1,
            url: url.to_string(),
            title: url.to_string(),
            description: None,
            author: None,
            image_url: None,
            published_at: now() - Duration::days(days_ago),
            date_source: DateSource::Structured,
        }
    }

    fn set(urls: &[&str]) -> HashSet<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    fn cutoff() -> DateTime<Utc> {
        age_cutoff(now(), Duration::days(DEFAULT_MAX_AGE_DAYS))
    }

    #[test]
    fn test_age_window() {
        let outcome = filter_new(
            vec![article("https://a/old", 20), article("https://a/new", 2)],
            &HashSet::new(),
            &HashSet::new(),
            cutoff(),
        );
        assert_eq!(outcome.accepted, vec![article("https://a/new", 2)]);
        assert_eq!(outcome.too_old, 1);
    }

    #[test]
    fn test_cutoff_is_inclusive() {
        let outcome = filter_new(
            vec![article("https://a/edge", DEFAULT_MAX_AGE_DAYS)],
            &HashSet::new(),
            &HashSet::new(),
            cutoff(),
        );
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn test_existing_and_tombstoned_are_rejected() {
        let outcome = filter_new(
            vec![
                article("https://a/stored", 1),
                article("https://a/deleted", 1),
                article("https://a/fresh", 1),
            ],
            &set(&["https://a/stored"]),
            &set(&["https://a/deleted"]),
            cutoff(),
        );
        let urls: Vec<&str> = outcome.accepted.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a/fresh"]);
        assert_eq!(outcome.existing, 1);
        assert_eq!(outcome.tombstoned, 1);
        assert_eq!(outcome.rejected(), 2);
    }

    #[test]
    fn test_repeated_url_in_batch_keeps_first() {
        let mut second = article("https://a/same", 1);
        second.title = "second".into();
        let outcome = filter_new(
            vec![article("https://a/same", 1), second],
            &HashSet::new(),
            &HashSet::new(),
            cutoff(),
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].title, "https://a/same");
        assert_eq!(outcome.duplicate_in_batch, 1);
    }

    proptest! {
        #[test]
        fn accepted_articles_satisfy_every_rule(
            entries in prop::collection::vec((0u8..12, 0i64..30), 0..40),
            existing in prop::collection::hash_set(0u8..12, 0..6),
            tombstones in prop::collection::hash_set(0u8..12, 0..6),
        ) {
            let url = |n: u8| format!("https://example.com/{}", n);
            let candidates: Vec<NewArticle> =
                entries.iter().map(|(n, age)| article(&url(*n), *age)).collect();
            let existing: HashSet<String> = existing.into_iter().map(url).collect();
            let tombstones: HashSet<String> = tombstones.into_iter().map(url).collect();
            let total = candidates.len();

            let outcome = filter_new(candidates, &existing, &tombstones, cutoff());

            let mut seen = HashSet::new();
            for a in &outcome.accepted {
                prop_assert!(!existing.contains(&a.url));
                prop_assert!(!tombstones.contains(&a.url));
                prop_assert!(a.published_at >= cutoff());
                prop_assert!(seen.insert(a.url.clone()));
            }
            prop_assert_eq!(outcome.accepted.len() + outcome.rejected(), total);
        }
    }
}
