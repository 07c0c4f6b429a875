//! Configuration file parser for the daemon's TOML config.
//!
//! Unlike an interactive client, the daemon has nothing to do without
//! sources, so a missing or empty file is an error. Unknown top-level keys
//! are accepted by serde but logged as warnings to catch typos.
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::{BackoffPolicy, EngineSettings, Source, MAX_DELAY, MAX_JITTER};
use crate::util::validate_source_url;

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

    /// The file parsed but describes an unusable setup.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level daemon configuration.
///
/// Every key except `sources` has a default, so a minimal file only lists
/// the sources to poll.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite state database. `:memory:` keeps state for one run only.
    pub database_path: PathBuf,

    /// Base poll interval for sources without their own.
    pub default_interval_secs: u64,

    /// Backoff ceiling for sources without their own.
    pub max_interval_secs: u64,

    /// Maximum number of polls in flight at once.
    pub concurrency: usize,

    /// Seen identities kept per source before the oldest are pruned.
    pub retention_per_source: usize,

    /// Upper bound on a single fetch, retries included.
    pub fetch_timeout_secs: u64,

    /// Upper bound on handing one entry to the output.
    pub delivery_timeout_secs: u64,

    /// How long shutdown waits for in-flight polls before abandoning them.
    pub shutdown_grace_secs: u64,

    /// Consecutive failures tolerated before a source is reported degraded.
    pub degraded_after_failures: u32,

    /// Relative jitter applied to failure backoff delays, in `[0, 0.5]`.
    pub jitter: f64,

    /// Permit sources on localhost and private networks.
    pub allow_private_hosts: bool,

    pub output: OutputConfig,

    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("skimd.db"),
            default_interval_secs: 900,
            max_interval_secs: 21_600,
            concurrency: 10,
            retention_per_source: 1000,
            fetch_timeout_secs: 30,
            delivery_timeout_secs: 10,
            shutdown_grace_secs: 10,
            degraded_after_failures: 5,
            jitter: 0.1,
            allow_private_hosts: false,
            output: OutputConfig::default(),
            sources: Vec::new(),
        }
    }
}

/// Where new entries are delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutputConfig {
    /// One `info` log line per entry.
    #[default]
    Log,
    /// One JSON object per line, appended to `path` or written to stdout.
    Jsonl { path: Option<PathBuf> },
}

/// One `[[sources]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    pub interval_secs: Option<u64>,
    pub max_interval_secs: Option<u64>,
    pub max_entries: Option<usize>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Longest accepted timeout or grace period.
    const MAX_TIMEOUT_SECS: u64 = 3600;

    const KNOWN_KEYS: [&'static str; 13] = [
        "database_path",
        "default_interval_secs",
        "max_interval_secs",
        "concurrency",
        "retention_per_source",
        "fetch_timeout_secs",
        "delivery_timeout_secs",
        "shutdown_grace_secs",
        "degraded_after_failures",
        "jitter",
        "allow_private_hosts",
        "output",
        "sources",
    ];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → `Err(ConfigError::Io)`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unusable values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a corrupted or huge file
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        // Parse as a raw table first to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.sources.is_empty() {
            return invalid("no sources configured".into());
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".into());
        }
        if self.retention_per_source == 0 {
            return invalid("retention_per_source must be at least 1".into());
        }
        for (key, secs) in [
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("delivery_timeout_secs", self.delivery_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
        ] {
            if secs == 0 || secs > Self::MAX_TIMEOUT_SECS {
                return invalid(format!(
                    "{} must be between 1 and {}",
                    key,
                    Self::MAX_TIMEOUT_SECS
                ));
            }
        }
        if self.default_interval_secs == 0 || self.max_interval_secs == 0 {
            return invalid("intervals must be at least 1 second".into());
        }
        if !(0.0..=MAX_JITTER).contains(&self.jitter) {
            return invalid(format!("jitter must be within [0, {}]", MAX_JITTER));
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return invalid(format!("source with url '{}' has an empty id", source.url));
            }
            if !ids.insert(source.id.as_str()) {
                return invalid(format!("duplicate source id '{}'", source.id));
            }
            if let Err(e) = validate_source_url(&source.url, self.allow_private_hosts) {
                return invalid(format!("source '{}': {}", source.id, e));
            }

            let (base, max) = self.intervals_for(source);
            if base.is_zero() || max.is_zero() {
                return invalid(format!("source '{}': intervals must be at least 1 second", source.id));
            }
            if base > MAX_DELAY || max > MAX_DELAY {
                return invalid(format!(
                    "source '{}': intervals must not exceed {} seconds",
                    source.id,
                    MAX_DELAY.as_secs()
                ));
            }
            if source.max_interval_secs.is_some() && max < base {
                return invalid(format!(
                    "source '{}': max_interval_secs ({}) is below its interval ({})",
                    source.id,
                    max.as_secs(),
                    base.as_secs()
                ));
            }
        }

        Ok(())
    }

    fn intervals_for(&self, source: &SourceConfig) -> (Duration, Duration) {
        let base = source.interval_secs.unwrap_or(self.default_interval_secs);
        let max = source.max_interval_secs.unwrap_or(self.max_interval_secs);
        (Duration::from_secs(base), Duration::from_secs(max))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            concurrency: self.concurrency,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            delivery_timeout: Duration::from_secs(self.delivery_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            retention_per_source: self.retention_per_source,
            backoff: BackoffPolicy::new(self.degraded_after_failures, self.jitter),
        }
    }

    /// Engine sources in configuration order. A source whose interval is
    /// above the global ceiling backs off no further than its own interval.
    pub fn sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .map(|s| {
                let (base, max) = self.intervals_for(s);
                Source::new(&s.id, &s.url, base, max)
                    .with_max_entries(s.max_entries)
                    .with_enabled(s.enabled)
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
[[sources]]
id = "lwn"
url = "https://lwn.net/headlines/rss"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.database_path, PathBuf::from("skimd.db"));
        assert_eq!(config.default_interval_secs, 900);
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.output, OutputConfig::Log);

        let sources = config.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].base_interval, Duration::from_secs(900));
        assert_eq!(sources[0].max_interval, Duration::from_secs(21_600));
        assert!(sources[0].enabled);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = ":memory:"
default_interval_secs = 300
max_interval_secs = 7200
concurrency = 4
retention_per_source = 50
fetch_timeout_secs = 10
degraded_after_failures = 3
jitter = 0.2

[output]
kind = "jsonl"
path = "out.jsonl"

[[sources]]
id = "a"
url = "https://a.example.com/feed"
interval_secs = 60
max_interval_secs = 600
max_entries = 20

[[sources]]
id = "b"
url = "http://b.example.com/rss"
enabled = false
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(
            config.output,
            OutputConfig::Jsonl {
                path: Some(PathBuf::from("out.jsonl"))
            }
        );

        let settings = config.engine_settings();
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.fetch_timeout, Duration::from_secs(10));
        assert_eq!(settings.retention_per_source, 50);

        let sources = config.sources();
        assert_eq!(sources[0].base_interval, Duration::from_secs(60));
        assert_eq!(sources[0].max_interval, Duration::from_secs(600));
        assert_eq!(sources[0].max_entries, Some(20));
        assert_eq!(sources[1].base_interval, Duration::from_secs(300));
        assert!(!sources[1].enabled);
    }

    #[test]
    fn test_jsonl_without_path() {
        let content = format!("[output]\nkind = \"jsonl\"\n{}", MINIMAL);
        let config = Config::from_toml(&content).unwrap();
        assert_eq!(config.output, OutputConfig::Jsonl { path: None });
    }

    fn assert_invalid(content: &str, needle: &str) {
        match Config::from_toml(content) {
            Err(ConfigError::Invalid(msg)) => {
                assert!(msg.contains(needle), "'{}' should mention '{}'", msg, needle)
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_no_sources_rejected() {
        assert_invalid("concurrency = 2\n", "no sources");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let content = format!("{}{}", MINIMAL, MINIMAL);
        assert_invalid(&content, "duplicate source id 'lwn'");
    }

    #[test]
    fn test_empty_id_rejected() {
        assert_invalid("[[sources]]\nid = \" \"\nurl = \"https://a.example.com\"\n", "empty id");
    }

    #[test]
    fn test_bad_urls_rejected() {
        assert_invalid("[[sources]]\nid = \"a\"\nurl = \"ftp://a.example.com\"\n", "'a'");
        assert_invalid("[[sources]]\nid = \"a\"\nurl = \"nope\"\n", "'a'");
        assert_invalid("[[sources]]\nid = \"a\"\nurl = \"http://127.0.0.1/rss\"\n", "'a'");
    }

    #[test]
    fn test_private_hosts_allowed_when_configured() {
        let content = "allow_private_hosts = true\n[[sources]]\nid = \"a\"\nurl = \"http://127.0.0.1:8080/rss\"\n";
        assert!(Config::from_toml(content).is_ok());
    }

    #[test]
    fn test_numeric_limits_rejected() {
        assert_invalid(&format!("concurrency = 0\n{}", MINIMAL), "concurrency");
        assert_invalid(&format!("retention_per_source = 0\n{}", MINIMAL), "retention");
        assert_invalid(&format!("jitter = 0.9\n{}", MINIMAL), "jitter");
        assert_invalid(&format!("default_interval_secs = 0\n{}", MINIMAL), "intervals");
        assert_invalid(&format!("delivery_timeout_secs = 0\n{}", MINIMAL), "delivery_timeout_secs");
        assert_invalid(&format!("shutdown_grace_secs = 7200\n{}", MINIMAL), "shutdown_grace_secs");
        assert_invalid(
            "[[sources]]\nid = \"a\"\nurl = \"https://a.example.com\"\ninterval_secs = 600\nmax_interval_secs = 60\n",
            "below its interval",
        );
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        assert_invalid(
            "[[sources]]\nid = \"a\"\nurl = \"https://a.example.com\"\ninterval_secs = 10000000000000\n",
            "must not exceed",
        );
        assert_invalid(&format!("max_interval_secs = 40000000\n{}", MINIMAL), "must not exceed");

        // A year is still accepted
        let year = "[[sources]]\nid = \"a\"\nurl = \"https://a.example.com\"\ninterval_secs = 31536000\n";
        assert!(Config::from_toml(year).is_ok());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        assert!(matches!(
            Config::from_toml("[[sources]\nid ="),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.sources[0].id, "lwn");
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(&dir.path().join("absent.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let padding = "#".repeat(Config::MAX_FILE_SIZE as usize + 1);
        std::fs::write(&path, padding).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::TooLarge(_))));
    }
}
