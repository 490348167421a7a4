use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, FeedType, Link};
use feed_rs::parser;
use regex::bytes::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;
use thiserror::Error;

use super::raw::{collect_items, RawElement};

/// Raw-string date elements tried when the structured date is missing.
const RAW_DATE_ELEMENTS: &[&str] = &["pubDate", "date", "issued", "created"];

#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not valid RSS, Atom, or JSON Feed
    #[error("Feed could not be parsed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
    Json,
}

/// A parsed feed, before any normalization.
#[derive(Debug, Clone)]
pub struct FeedDocument {
    pub format: FeedFormat,
    pub title: Option<String>,
    pub description: Option<String>,
    /// The feed's own website link, if it declares one
    pub site_link: Option<String>,
    pub items: Vec<RawItem>,
}

/// One item as the document presents it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    pub title: Option<String>,
    pub link: Option<String>,
    /// Summary, or full content when there is no summary. May contain HTML.
    pub description: Option<String>,
    pub author: Option<String>,
    /// Publish date the parser understood (`published`, else `updated`)
    pub published: Option<DateTime<Utc>>,
    /// Raw date text, kept for lenient parsing when `published` is missing
    pub published_raw: Option<String>,
    /// The item's element tree, when the document could be walked
    pub element: Option<RawElement>,
}

fn doctype_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<!\s*doctype\s+").expect("Invalid regex"))
}

/// Repair the malformations that trip up strict XML parsers.
///
/// Strips a UTF-8 byte-order mark and leading whitespace, and rewrites any
/// `<!doctype ...>` spelling to `<!DOCTYPE ...>`.
pub fn repair_xml(bytes: &[u8]) -> Cow<'_, [u8]> {
    let without_bom = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = without_bom
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(without_bom.len());
    let trimmed = &without_bom[start..];

    match doctype_re().replace_all(trimmed, &b"<!DOCTYPE "[..]) {
        Cow::Borrowed(_) => Cow::Borrowed(trimmed),
        Cow::Owned(fixed) => Cow::Owned(fixed),
    }
}

/// Parse an RSS, Atom, or JSON Feed document.
///
/// # Errors
///
/// Returns [`ParseError::Malformed`] carrying the underlying parser message.
pub fn parse_document(bytes: &[u8]) -> Result<FeedDocument, ParseError> {
    let repaired = repair_xml(bytes);
    let feed = parser::parse(repaired.as_ref()).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let format = match feed.feed_type {
        FeedType::Atom => FeedFormat::Atom,
        FeedType::JSON => FeedFormat::Json,
        _ => FeedFormat::Rss,
    };

    // Trees are only usable if they line up one-to-one with the entries
    let mut trees = match format {
        FeedFormat::Json => None,
        _ => collect_items(&repaired).filter(|trees| trees.len() == feed.entries.len()),
    }
    .map(Vec::into_iter);
    if trees.is_none() && format != FeedFormat::Json && !feed.entries.is_empty() {
        tracing::debug!(
            entries = feed.entries.len(),
            "Item element trees unavailable, date and image fallbacks disabled"
        );
    }

    let site_link = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty());

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let element = trees.as_mut().and_then(Iterator::next);
            raw_item(entry, element)
        })
        .collect();

    Ok(FeedDocument {
        format,
        title: feed.title.map(|t| t.content.trim().to_string()).filter(|t| !t.is_empty()),
        description: feed
            .description
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty()),
        site_link,
        items,
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

/// Prefer the `alternate` link; Atom entries often list `self`, `edit`,
/// `replies` and `enclosure` links too.
fn item_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .and_then(|l| non_empty(l.href.clone()))
}

fn raw_item(entry: Entry, element: Option<RawElement>) -> RawItem {
    let published_raw = element.as_ref().and_then(|e| {
        RAW_DATE_ELEMENTS
            .iter()
            .find_map(|name| e.child_text(name))
            .map(str::to_string)
    });

    RawItem {
        title: entry.title.and_then(|t| non_empty(t.content)),
        link: item_link(&entry.links),
        description: entry
            .summary
            .and_then(|s| non_empty(s.content))
            .or_else(|| entry.content.and_then(|c| c.body).and_then(non_empty)),
        author: entry
            .authors
            .into_iter()
            .find_map(|person| non_empty(person.name)),
        published: entry.published.or(entry.updated),
        published_raw,
        element,
    }
}
