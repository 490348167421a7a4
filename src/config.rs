//! Configuration file parser for ~/.config/briefed/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::fetcher::DEFAULT_USER_AGENT;
use crate::feed::{HttpSettings, IngestOptions, Retention, RetryPolicy};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but cannot be used.
    #[error("Invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Defaults to `briefed.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Minutes between polls in daemon mode.
    pub refresh_interval_minutes: u64,

    /// Items published longer ago than this are not ingested.
    pub max_article_age_days: u32,

    /// Articles published longer ago than this are pruned. 0 = keep forever.
    pub article_retention_days: u32,

    /// Tombstones older than this are forgotten. 0 = keep forever.
    pub tombstone_retention_days: u32,

    /// Feeds polled at once.
    pub concurrency: usize,

    pub request_timeout_secs: u64,

    /// Attempts per fetch, including the first.
    pub max_attempts: u32,

    /// Backoff unit; the wait after attempt n is n × this.
    pub retry_backoff_secs: u64,

    pub max_redirects: usize,

    pub user_agent: String,

    /// Allow subscribing to localhost and private network addresses.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            refresh_interval_minutes: 60,
            max_article_age_days: 14,
            article_retention_days: 30,
            tombstone_retention_days: 0,
            concurrency: 4,
            request_timeout_secs: 90,
            max_attempts: 3,
            retry_backoff_secs: 1,
            max_redirects: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allow_private_hosts: false,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "refresh_interval_minutes",
    "max_article_age_days",
    "article_retention_days",
    "tombstone_retention_days",
    "concurrency",
    "request_timeout_secs",
    "max_attempts",
    "retry_backoff_secs",
    "max_redirects",
    "user_agent",
    "allow_private_hosts",
];

fn days(n: u32) -> Option<ChronoDuration> {
    (n > 0).then(|| ChronoDuration::days(i64::from(n)))
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unusable values (zero attempts, zero concurrency) → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a huge or corrupted file
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            refresh_interval_minutes = config.refresh_interval_minutes,
            concurrency = config.concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool, &str); 4] = [
            ("concurrency", self.concurrency == 0, "must be at least 1"),
            ("max_attempts", self.max_attempts == 0, "must be at least 1"),
            ("request_timeout_secs", self.request_timeout_secs == 0, "must be at least 1"),
            ("user_agent", self.user_agent.trim().is_empty(), "must not be empty"),
        ];
        for (key, failed, reason) in checks {
            if failed {
                return Err(ConfigError::Invalid {
                    key,
                    reason: reason.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The configured database path, or `briefed.db` inside `config_dir`.
    pub fn database_path_or(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("briefed.db"))
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_redirects: self.max_redirects,
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            max_age: ChronoDuration::days(i64::from(self.max_article_age_days)),
            concurrency: self.concurrency,
            allow_private_hosts: self.allow_private_hosts,
        }
    }

    pub fn retention(&self) -> Retention {
        Retention {
            articles: days(self.article_retention_days),
            tombstones: days(self.tombstone_retention_days),
        }
    }

    /// Daemon poll interval. Never zero.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.max(1) * 60)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_path, None);
        assert_eq!(config.refresh_interval_minutes, 60);
        assert_eq!(config.max_article_age_days, 14);
        assert_eq!(config.article_retention_days, 30);
        assert_eq!(config.tombstone_retention_days, 0);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff_secs, 1);
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.refresh_interval_minutes, 60);
    }

    #[test]
    fn test_empty_and_whitespace_files_return_default() {
        for content in ["", "   \n  \n  "] {
            let (_dir, path) = write_config(content);
            let config = Config::load(&path).unwrap();
            assert_eq!(config.concurrency, 4);
        }
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (_dir, path) = write_config("concurrency = 8\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
database_path = "/var/lib/briefed/feeds.db"
refresh_interval_minutes = 15
max_article_age_days = 7
article_retention_days = 0
tombstone_retention_days = 365
concurrency = 2
request_timeout_secs = 20
max_attempts = 5
retry_backoff_secs = 2
max_redirects = 3
user_agent = "briefed-test"
allow_private_hosts = true
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.database_path_or(Path::new("/unused")),
            PathBuf::from("/var/lib/briefed/feeds.db")
        );
        assert_eq!(config.refresh_interval(), Duration::from_secs(15 * 60));

        let http = config.http_settings();
        assert_eq!(http.timeout, Duration::from_secs(20));
        assert_eq!(http.max_redirects, 3);
        assert_eq!(http.user_agent, "briefed-test");

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff, Duration::from_secs(2));

        let options = config.ingest_options();
        assert_eq!(options.max_age, ChronoDuration::days(7));
        assert_eq!(options.concurrency, 2);
        assert!(options.allow_private_hosts);

        let retention = config.retention();
        assert_eq!(retention.articles, None);
        assert_eq!(retention.tombstones, Some(ChronoDuration::days(365)));
    }

    #[test]
    fn test_default_database_path_is_in_config_dir() {
        let config = Config::default();
        assert_eq!(
            config.database_path_or(Path::new("/home/u/.config/briefed")),
            PathBuf::from("/home/u/.config/briefed/briefed.db")
        );
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (_dir, path) = write_config("this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (_dir, path) = write_config("concurrency = 2\ntheme = \"dark\"\n");
        assert_eq!(Config::load(&path).unwrap().concurrency, 2);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (_dir, path) = write_config("concurrency = \"lots\"\n");
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_values_rejected() {
        let (_dir, path) = write_config("max_attempts = 0\n");
        match Config::load(&path) {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "max_attempts"),
            other => panic!("Expected Invalid, got {:?}", other),
        }

        let (_dir, path) = write_config("concurrency = 0\n");
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Invalid { key: "concurrency", .. })
        ));
    }

    #[test]
    fn test_zero_refresh_interval_is_clamped() {
        let config = Config {
            refresh_interval_minutes: 0,
            ..Default::default()
        };
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (_dir, path) = write_config(&"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }
}
