//! Utility functions shared by the ingestion pipeline.
//!
//! - **Text processing**: HTML-to-text reduction and character-safe truncation
//! - **URLs**: subscription URL validation, site root and favicon derivation
//! - **Shutdown**: a cloneable cancellation signal for network-bound work
//!
//! # Examples
//!
//! ```
//! use briefed::util::{favicon_url, strip_html, truncate_chars};
//!
//! assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
//! assert_eq!(truncate_chars("abcdef", 3), "abc");
//! assert_eq!(
//!     favicon_url("https://example.com/blog").as_deref(),
//!     Some("https://example.com/favicon.ico")
//! );
//! ```

mod shutdown;
mod text;
mod urls;

pub use shutdown::{Shutdown, ShutdownTrigger};
pub use text::{snippet, strip_html, truncate_chars, MAX_DESCRIPTION_CHARS};
pub use urls::{favicon_url, site_root, validate_url, UrlValidationError};
