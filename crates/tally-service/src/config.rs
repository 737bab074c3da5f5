use chrono::{FixedOffset, NaiveTime, Weekday};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("UTC offset out of range: {0} minutes")]
    Offset(i32),
}

/// Service configuration.
///
/// Defaults, then an optional TOML file named by `TALLY_CONFIG`, then
/// `TALLY_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance accepted as a match.
    pub match_threshold: f32,
    /// Local time after which a recognized check-in counts as late.
    pub late_after: NaiveTime,
    /// Whether unrecognized samples are written as unauthorized attempts.
    pub record_unauthorized: bool,
    /// Offset of the attendance calendar from UTC, in minutes.
    pub utc_offset_minutes: i32,
    /// Weekdays without expected attendance.
    pub non_working_days: Vec<Weekday>,
    /// Timeout per historical fetch attempt.
    pub fetch_timeout_secs: u64,
    /// Total historical fetch attempts before giving up.
    pub fetch_retries: u32,
    /// Base delay between attempts; doubles on each retry.
    pub fetch_backoff_ms: u64,
    /// Buffered live events per subscriber.
    pub feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("tally");

        Self {
            db_path: data_dir.join("attendance.db"),
            match_threshold: tally_core::DEFAULT_MATCH_THRESHOLD,
            late_after: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            record_unauthorized: true,
            utc_offset_minutes: 0,
            non_working_days: tally_core::calendar::DEFAULT_NON_WORKING.to_vec(),
            fetch_timeout_secs: 10,
            fetch_retries: 3,
            fetch_backoff_ms: 200,
            feed_capacity: tally_store::feed::DEFAULT_FEED_CAPACITY,
        }
    }
}

impl Config {
    /// Load from `TALLY_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("TALLY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `TALLY_*` overrides looked up through `lookup`.
    /// Values that fail to parse leave the current setting in place.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable config override");
                    None
                }
            }
        }

        if let Some(path) = lookup("TALLY_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(v) = parsed(&lookup, "TALLY_MATCH_THRESHOLD") {
            self.match_threshold = v;
        }
        if let Some(raw) = lookup("TALLY_LATE_AFTER") {
            match NaiveTime::parse_from_str(raw.trim(), "%H:%M") {
                Ok(t) => self.late_after = t,
                Err(_) => tracing::warn!(value = %raw, "ignoring unparsable TALLY_LATE_AFTER"),
            }
        }
        if let Some(raw) = lookup("TALLY_RECORD_UNAUTHORIZED") {
            self.record_unauthorized = raw.trim() != "0";
        }
        if let Some(v) = parsed(&lookup, "TALLY_UTC_OFFSET_MINUTES") {
            self.utc_offset_minutes = v;
        }
        if let Some(v) = parsed(&lookup, "TALLY_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TALLY_FETCH_RETRIES") {
            self.fetch_retries = v;
        }
        if let Some(v) = parsed(&lookup, "TALLY_FETCH_BACKOFF_MS") {
            self.fetch_backoff_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TALLY_FEED_CAPACITY") {
            self.feed_capacity = v;
        }
        self
    }

    /// Calendar offset from UTC.
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or(ConfigError::Offset(self.utc_offset_minutes))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch_retries.max(1),
            base_backoff: Duration::from_millis(self.fetch_backoff_ms),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.late_after, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(config.non_working_days, vec![Weekday::Sat, Weekday::Sun]);
        assert!(config.db_path.ends_with("tally/attendance.db"));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default().with_overrides(lookup(&[
            ("TALLY_DB_PATH", "/var/lib/tally/a.db"),
            ("TALLY_MATCH_THRESHOLD", "0.45"),
            ("TALLY_LATE_AFTER", "08:30"),
            ("TALLY_RECORD_UNAUTHORIZED", "0"),
            ("TALLY_UTC_OFFSET_MINUTES", "-300"),
            ("TALLY_FETCH_RETRIES", "5"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/tally/a.db"));
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.late_after, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert!(!config.record_unauthorized);
        assert_eq!(config.offset().unwrap().local_minus_utc(), -300 * 60);
        assert_eq!(config.retry_policy().attempts, 5);
    }

    #[test]
    fn test_bad_override_keeps_value() {
        let config = Config::default().with_overrides(lookup(&[
            ("TALLY_MATCH_THRESHOLD", "loose"),
            ("TALLY_LATE_AFTER", "nine"),
        ]));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.late_after, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            match_threshold = 0.5
            utc_offset_minutes = 120
            non_working_days = ["Fri", "Sat"]
            late_after = "10:15:00"
            "#,
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.non_working_days, vec![Weekday::Fri, Weekday::Sat]);
        assert_eq!(config.late_after, NaiveTime::from_hms_opt(10, 15, 0).unwrap());
        assert_eq!(config.fetch_retries, 3);
    }

    #[test]
    fn test_offset_out_of_range() {
        let config = Config {
            utc_offset_minutes: 24 * 60,
            ..Config::default()
        };
        assert!(matches!(config.offset(), Err(ConfigError::Offset(1440))));
    }

    #[test]
    fn test_retry_policy_has_at_least_one_attempt() {
        let config = Config {
            fetch_retries: 0,
            ..Config::default()
        };
        assert_eq!(config.retry_policy().attempts, 1);
    }
}
