use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use super::parser::{FeedDocument, RawItem};
use crate::storage::{DateSource, NewArticle};
use crate::util::{site_root, strip_html, truncate_chars, MAX_DESCRIPTION_CHARS};

const UNTITLED: &str = "Untitled";

/// Formats carrying their own offset, tried after RFC 2822 and RFC 3339.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%a, %d %b %Y %H:%M %z",
    "%d %b %Y %H:%M:%S %z",
    "%A, %d %B %Y %H:%M:%S %z",
];

/// Formats without an offset; read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%B %d, %Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d %b %Y", "%d %B %Y", "%B %d, %Y", "%b %d, %Y"];

/// Parse a date string the way feeds in the wild actually write them.
///
/// Returns `None` rather than guessing when nothing matches.
pub fn parse_date_lenient(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // A trailing UTC/GMT/Z names the zone we assume anyway
    let naive = ["UTC", "GMT", "Z"]
        .iter()
        .find_map(|suffix| raw.strip_suffix(suffix))
        .map(str::trim_end)
        .unwrap_or(raw);

    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(naive, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    None
}

/// Resolve an item's publish date, first success wins:
/// the parser's structured date, the raw date string, an `updated` then
/// `published` element anywhere in the item tree, and finally `now`.
pub fn resolve_published(item: &RawItem, now: DateTime<Utc>) -> (DateTime<Utc>, DateSource) {
    if let Some(published) = item.published {
        return (published, DateSource::Structured);
    }

    if let Some(raw) = item.published_raw.as_deref() {
        match parse_date_lenient(raw) {
            Some(published) => return (published, DateSource::RawString),
            None => tracing::debug!(raw = raw, "Unparseable item date, trying element tree"),
        }
    }

    if let Some(element) = &item.element {
        for name in ["updated", "published"] {
            let parsed = element
                .find(name)
                .and_then(|e| parse_date_lenient(&e.text));
            if let Some(published) = parsed {
                return (published, DateSource::ElementTree);
            }
        }
    }

    (now, DateSource::Fallback)
}

/// URL of the first `thumbnail` or `image` element that carries one.
pub fn image_url(item: &RawItem) -> Option<String> {
    item.element
        .as_ref()?
        .descendants()
        .filter(|e| e.name == "thumbnail" || e.name == "image")
        .find_map(|e| e.attribute("url"))
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

/// Reduce an HTML description to bounded plain text. Empty results are `None`.
pub fn clean_description(html: &str) -> Option<String> {
    let text = strip_html(html);
    if text.is_empty() {
        return None;
    }
    Some(truncate_chars(&text, MAX_DESCRIPTION_CHARS).into_owned())
}

/// The feed's website: its declared link, else the feed URL's scheme and host.
pub fn site_url(doc: &FeedDocument, feed_url: &str) -> Option<String> {
    doc.site_link.clone().or_else(|| site_root(feed_url))
}

/// Turn a raw item into an article owned by `feed_id`.
///
/// An item without a link takes the feed URL as its own, so it is still
/// stored (and deduplicated) rather than dropped.
pub fn normalize(feed_id: i64, feed_url: &str, item: &RawItem) -> NewArticle {
    normalize_at(feed_id, feed_url, item, Utc::now())
}

/// [`normalize`] with an explicit processing time for the date fallback.
pub fn normalize_at(
    feed_id: i64,
    feed_url: &str,
    item: &RawItem,
    now: DateTime<Utc>,
) -> NewArticle {
    let (published_at, date_source) = resolve_published(item, now);

    let url = match item.link.as_deref().map(str::trim) {
        Some(link) if !link.is_empty() => link.to_string(),
        _ => {
            tracing::debug!(feed_id = feed_id, "Item has no link, using feed URL");
            feed_url.to_string()
        }
    };

    NewArticle {
        feed_id,
        url,
        title: item
            .title
            .clone()
            .unwrap_or_else(|| UNTITLED.to_string()),
        description: item.description.as_deref().and_then(clean_description),
        author: item.author.clone(),
        image_url: image_url(item),
        published_at,
        date_source,
    }
}
