use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::util::{snippet, Shutdown};

/// Bodies larger than this are rejected.
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
/// Characters of an unexpected body kept for diagnostics.
const SNIPPET_CHARS: usize = 100;
/// How far into a body to look for its root element.
const SNIFF_WINDOW: usize = 64 * 1024;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                                      (KHTML, like Gecko) Chrome/124.0 Safari/537.36 briefed/0.1";

const ACCEPT_FEEDS: &str = "application/rss+xml, application/atom+xml, application/feed+json, \
                            application/xml;q=0.9, text/xml;q=0.9, */*;q=0.8";

/// Coarse classification of why a feed could not be ingested, stable enough
/// to key UI messages and JSON output on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Forbidden,
    Tls,
    Timeout,
    HttpStatus,
    RateLimited,
    NotAFeed,
    EmptyBody,
    Exhausted,
    TooLarge,
    Cancelled,
    Malformed,
    /// The URL could not be turned into a request; nothing was sent
    InvalidUrl,
    Infra,
}

/// Errors that can occur while downloading a feed document.
///
/// Display strings are written for the person who subscribed to the feed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Feed not found (404). The feed URL may have moved or been removed.")]
    NotFound,
    #[error("Access forbidden (403). The server refused to serve this feed.")]
    Forbidden,
    /// Non-2xx terminal status, including a 3xx left over after the redirect limit
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Rate limited (429) after {attempts} attempts. Try again later.")]
    RateLimited { attempts: u32 },
    #[error("Request timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("SSL/TLS connection error. The site's certificate may be invalid or expired: {0}")]
    Tls(String),
    #[error("The URL returned a web page, not a feed: {snippet}")]
    NotAFeed { snippet: String },
    #[error("The server returned an empty response")]
    EmptyBody,
    #[error("Failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
    #[error("Response too large")]
    TooLarge,
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("Fetch cancelled by shutdown")]
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NotFound => FailureKind::NotFound,
            FetchError::Forbidden => FailureKind::Forbidden,
            FetchError::HttpStatus(_) => FailureKind::HttpStatus,
            FetchError::InvalidUrl(_) => FailureKind::InvalidUrl,
            FetchError::RateLimited { .. } => FailureKind::RateLimited,
            FetchError::Timeout { .. } => FailureKind::Timeout,
            FetchError::Tls(_) => FailureKind::Tls,
            FetchError::NotAFeed { .. } => FailureKind::NotAFeed,
            FetchError::EmptyBody => FailureKind::EmptyBody,
            FetchError::Exhausted { .. } | FetchError::IncompleteResponse { .. } => {
                FailureKind::Exhausted
            }
            FetchError::TooLarge => FailureKind::TooLarge,
            FetchError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// A downloaded document that passed sniffing.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// URL after redirects
    pub final_url: String,
}

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            max_redirects: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Linear backoff: the wait after attempt `n` is `n × backoff`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Create a redirect policy with loop detection and limited hops.
///
/// Exceeding the limit or revisiting a URL stops following and hands back the
/// 3xx response, which the fetcher reports as [`FetchError::HttpStatus`].
fn create_redirect_policy(max_redirects: usize) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            tracing::debug!(url = %attempt.url(), max = max_redirects, "Redirect limit reached");
            return attempt.stop();
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev == url) {
            tracing::debug!(url = %url, "Redirect loop detected");
            return attempt.stop();
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len(),
            "Following redirect"
        );
        attempt.follow()
    })
}

/// Build the one HTTP client shared by every fetch in the process.
pub fn build_http_client(settings: &HttpSettings) -> Result<reqwest::Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_FEEDS));

    reqwest::Client::builder()
        .redirect(create_redirect_policy(settings.max_redirects))
        .user_agent(settings.user_agent.as_str())
        .default_headers(headers)
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(30))
        .timeout(settings.timeout)
        .build()
}

/// Failure of a single request, before retry policy is applied.
enum AttemptError {
    Fatal(FetchError),
    Transient(Transient),
}

enum Transient {
    Timeout,
    Connect(String),
    Status(u16),
    Incomplete { expected: u64, received: usize },
}

impl Transient {
    fn exhausted(self, attempts: u32) -> FetchError {
        match self {
            Transient::Timeout => FetchError::Timeout { attempts },
            Transient::Connect(message) => FetchError::Exhausted { attempts, message },
            Transient::Status(429) => FetchError::RateLimited { attempts },
            Transient::Status(code) => FetchError::HttpStatus(code),
            Transient::Incomplete { expected, received } => {
                FetchError::IncompleteResponse { expected, received }
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Transient::Timeout => "timeout".to_string(),
            Transient::Connect(message) => message.clone(),
            Transient::Status(code) => format!("status {}", code),
            Transient::Incomplete { expected, received } => {
                format!("incomplete body ({} of {} bytes)", received, expected)
            }
        }
    }
}

/// Downloads feed documents with retry, size limits, and content sniffing.
///
/// Stateless apart from the shared client; clone freely across workers.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    max_body_bytes: usize,
    shutdown: Shutdown,
}

impl FeedFetcher {
    pub fn new(client: reqwest::Client, retry: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            client,
            retry,
            max_body_bytes: MAX_FEED_SIZE,
            shutdown,
        }
    }

    pub fn with_body_limit(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Fetch a feed document.
    ///
    /// Timeouts, connection failures, 429, 5xx and truncated bodies are
    /// retried up to `max_attempts` times with linear backoff. Every other
    /// failure returns immediately. Both requests and backoff sleeps end
    /// early with [`FetchError::Cancelled`] once shutdown is requested.
    pub async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(FetchError::Cancelled),
                result = self.fetch_once(url) => result,
            };

            let transient = match result {
                Ok(feed) => return Ok(feed),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(t)) => t,
            };

            if attempt >= max_attempts {
                return Err(transient.exhausted(attempt));
            }

            let delay = self.retry.delay_after(attempt);
            tracing::warn!(
                url = %url,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %transient.describe(),
                "Fetch failed, retrying after delay"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedFeed, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AttemptError::Transient(Transient::Status(status.as_u16())));
        }
        match status {
            StatusCode::NOT_FOUND => return Err(AttemptError::Fatal(FetchError::NotFound)),
            StatusCode::FORBIDDEN => return Err(AttemptError::Fatal(FetchError::Forbidden)),
            s if !s.is_success() => {
                return Err(AttemptError::Fatal(FetchError::HttpStatus(s.as_u16())))
            }
            _ => {}
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = read_limited_bytes(response, self.max_body_bytes).await?;
        sniff(&bytes).map_err(AttemptError::Fatal)?;

        Ok(FetchedFeed {
            bytes,
            content_type,
            final_url,
        })
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, AttemptError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(AttemptError::Fatal(FetchError::TooLarge));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_request_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(AttemptError::Fatal(FetchError::TooLarge));
        }
        bytes.extend_from_slice(&chunk);
    }

    // Received fewer bytes than Content-Length: the connection dropped mid-body
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(AttemptError::Transient(Transient::Incomplete {
                expected,
                received: bytes.len(),
            }));
        }
    }

    Ok(bytes)
}

fn classify_request_error(err: reqwest::Error) -> AttemptError {
    if err.is_timeout() {
        return AttemptError::Transient(Transient::Timeout);
    }
    if err.is_builder() {
        return AttemptError::Fatal(FetchError::InvalidUrl(err.to_string()));
    }

    let chain = error_chain(&err);
    if looks_like_tls(&chain) {
        return AttemptError::Fatal(FetchError::Tls(chain));
    }
    AttemptError::Transient(Transient::Connect(chain))
}

/// The error and all of its sources joined with `: `.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn looks_like_tls(chain: &str) -> bool {
    let lower = chain.to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn strip_leading_noise(bytes: &[u8]) -> &[u8] {
    trim_start(bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes))
}

fn starts_with_ignore_case(haystack: &[u8], prefix: &[u8]) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_name_end(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'>' || b == b'/'
}

/// Element name up to the first whitespace, `>` or `/`.
fn tag_name(after_lt: &[u8]) -> &[u8] {
    let len = after_lt
        .iter()
        .position(|&b| is_name_end(b))
        .unwrap_or(after_lt.len());
    &after_lt[..len]
}

fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(colon) => &name[colon + 1..],
        None => name,
    }
}

fn is_feed_root(name: &[u8]) -> bool {
    let local = local_name(name);
    [&b"rss"[..], b"feed", b"rdf"]
        .iter()
        .any(|root| local.eq_ignore_ascii_case(root))
}

fn is_html_element(name: &[u8]) -> bool {
    let local = local_name(name);
    [&b"html"[..], b"head", b"body"]
        .iter()
        .any(|tag| local.eq_ignore_ascii_case(tag))
}

/// The markup a document opens with.
#[derive(Debug, PartialEq, Eq)]
struct Prologue<'a> {
    /// A `<!DOCTYPE html ...>` was seen, including XHTML doctypes
    html_doctype: bool,
    /// Name of the first element, if one starts inside the window
    root: Option<&'a [u8]>,
}

/// Skip the XML declaration, processing instructions, comments and the
/// doctype, and return the first element's name.
fn read_prologue(head: &[u8]) -> Prologue<'_> {
    let mut rest = head;
    let mut html_doctype = false;

    loop {
        rest = trim_start(rest);
        let skip = if rest.starts_with(b"<?") {
            find(rest, b"?>").map(|end| end + 2)
        } else if rest.starts_with(b"<!--") {
            find(&rest[4..], b"-->").map(|end| end + 7)
        } else if starts_with_ignore_case(rest, b"<!doctype") {
            let name = trim_start(&rest[9..]);
            if starts_with_ignore_case(name, b"html")
                && name.get(4).map_or(true, |&b| is_name_end(b))
            {
                html_doctype = true;
            }
            // An internal subset may itself contain `>`
            match rest.iter().position(|&b| b == b'[' || b == b'>') {
                Some(i) if rest[i] == b'[' => find(&rest[i..], b"]>").map(|end| i + end + 2),
                Some(i) => Some(i + 1),
                None => None,
            }
        } else {
            None
        };

        match skip {
            Some(len) => rest = &rest[len..],
            None => break,
        }
    }

    let root = match rest {
        [b'<', next, ..] if next.is_ascii_alphabetic() || *next == b'_' => {
            Some(tag_name(&rest[1..]))
        }
        _ => None,
    };
    Prologue { html_doctype, root }
}

/// Reject bodies that cannot be a feed before handing them to the parser.
///
/// The body's first element decides: a feed root (`rss`, `feed`, `rdf:RDF`)
/// passes even behind a stray HTML doctype, `html`/`head`/`body` or any other
/// element behind an HTML doctype is a web page. Unknown XML roots are left
/// for the parser to reject.
fn sniff(bytes: &[u8]) -> Result<(), FetchError> {
    let body = strip_leading_noise(bytes);
    let Some(&first) = body.first() else {
        return Err(FetchError::EmptyBody);
    };
    let not_a_feed = || FetchError::NotAFeed {
        snippet: snippet(body, SNIPPET_CHARS),
    };

    match first {
        b'{' => return Ok(()),
        b'<' => {}
        _ => return Err(not_a_feed()),
    }

    let prologue = read_prologue(&body[..body.len().min(SNIFF_WINDOW)]);
    match prologue.root {
        Some(name) if is_feed_root(name) => Ok(()),
        Some(name) if is_html_element(name) => Err(not_a_feed()),
        _ if prologue.html_doctype => Err(not_a_feed()),
        _ => Ok(()),
    }
}
