use std::path::PathBuf;
use std::time::Duration;

use challenge_progress_core::ProgressError;
use serde::Serialize;

pub const DEFAULT_DB_PATH: &str = "./challenge_progress.sqlite3";
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 25;
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 5;
pub const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(300);
pub const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(300);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and pool settings for [`crate::ProgressStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME,
            conn_max_idle_time: DEFAULT_CONN_MAX_IDLE_TIME,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Reads `DB_*` variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let number = |key: &str| -> Option<u64> {
            lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok())
        };
        let count = |key: &str, fallback: u32| -> u32 {
            number(key)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(fallback)
        };

        Self {
            db_path: lookup("DB_PATH")
                .filter(|value| !value.trim().is_empty())
                .map_or(defaults.db_path, PathBuf::from),
            max_open_conns: count("DB_MAX_OPEN_CONNS", defaults.max_open_conns),
            max_idle_conns: count("DB_MAX_IDLE_CONNS", defaults.max_idle_conns),
            conn_max_lifetime: number("DB_CONN_MAX_LIFETIME")
                .map_or(defaults.conn_max_lifetime, Duration::from_secs),
            conn_max_idle_time: number("DB_CONN_MAX_IDLE_TIME")
                .map_or(defaults.conn_max_idle_time, Duration::from_secs),
            acquire_timeout: number("DB_ACQUIRE_TIMEOUT_MS")
                .map_or(defaults.acquire_timeout, Duration::from_millis),
            busy_timeout: number("DB_BUSY_TIMEOUT_MS")
                .map_or(defaults.busy_timeout, Duration::from_millis),
        }
    }

    /// # Errors
    /// Returns [`ProgressError::Configuration`] when the pool bounds are inconsistent.
    pub fn validate(&self) -> Result<(), ProgressError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ProgressError::Configuration(
                "db_path MUST be provided".to_string(),
            ));
        }
        if self.max_open_conns == 0 {
            return Err(ProgressError::Configuration(
                "max_open_conns MUST be >= 1".to_string(),
            ));
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(ProgressError::Configuration(format!(
                "max_idle_conns ({}) MUST NOT exceed max_open_conns ({})",
                self.max_idle_conns, self.max_open_conns
            )));
        }
        for (field, value) in [
            ("conn_max_lifetime", self.conn_max_lifetime),
            ("conn_max_idle_time", self.conn_max_idle_time),
            ("acquire_timeout", self.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(ProgressError::Configuration(format!(
                    "{field} MUST be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = StoreConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.max_open_conns, 25);
        assert_eq!(config.max_idle_conns, 5);
        assert_eq!(config.conn_max_lifetime, Duration::from_secs(300));
    }

    #[test]
    fn environment_values_override_defaults() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            ("DB_PATH", "/tmp/progress.sqlite3"),
            ("DB_MAX_OPEN_CONNS", "8"),
            ("DB_MAX_IDLE_CONNS", "2"),
            ("DB_CONN_MAX_LIFETIME", "60"),
            ("DB_CONN_MAX_IDLE_TIME", "30"),
            ("DB_ACQUIRE_TIMEOUT_MS", "250"),
            ("DB_BUSY_TIMEOUT_MS", "1500"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/tmp/progress.sqlite3"));
        assert_eq!(config.max_open_conns, 8);
        assert_eq!(config.max_idle_conns, 2);
        assert_eq!(config.conn_max_lifetime, Duration::from_secs(60));
        assert_eq!(config.conn_max_idle_time, Duration::from_secs(30));
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.busy_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            ("DB_MAX_OPEN_CONNS", "lots"),
            ("DB_MAX_IDLE_CONNS", "-1"),
            ("DB_CONN_MAX_LIFETIME", "5m"),
            ("DB_PATH", "   "),
        ]));
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn validate_rejects_inconsistent_pool_bounds() {
        let mut config = StoreConfig::default();
        assert!(config.validate().is_ok());

        config.max_idle_conns = config.max_open_conns + 1;
        assert!(matches!(
            config.validate(),
            Err(ProgressError::Configuration(_))
        ));

        config = StoreConfig {
            max_open_conns: 0,
            max_idle_conns: 0,
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());

        config = StoreConfig {
            acquire_timeout: Duration::ZERO,
            ..StoreConfig::default()
        };
        let message = match config.validate() {
            Err(err) => err.to_string(),
            Ok(()) => panic!("zero acquire timeout should be rejected"),
        };
        assert!(message.contains("acquire_timeout"));
    }
}
