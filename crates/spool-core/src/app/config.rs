//! WorkerConfig - ワーカーの設定
//!
//! All durations come from the environment in milliseconds (`SPOOL_*_MS`).

use std::time::Duration;

use crate::domain::RetryPolicy;

const DEFAULT_QUEUES: &str = "default";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_BACKOFF_MS: u64 = 2_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 300_000;
const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_STORE_RETRY_BASE_MS: u64 = 100;
const DEFAULT_STALE_AFTER_MS: u64 = 600_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Queues to consume when the worker is started through [`crate::app::run`].
    pub queue_names: Vec<String>,

    /// Dispatches per task, the first one included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,

    /// How long one claim blocks. Bounds how quickly an idle loop sees shutdown.
    pub claim_timeout: Duration,

    pub store_retry_attempts: u32,
    pub store_retry_base: Duration,

    pub handler_timeout: Option<Duration>,

    /// `None`: every loop dispatches independently.
    pub max_concurrent_handlers: Option<usize>,

    /// Staged entries older than this are returned to pending on startup,
    /// which is how tasks held by a crashed worker come back. Must exceed the
    /// longest handler run, or live claims of other workers get redelivered.
    /// `None` (`SPOOL_STALE_AFTER_MS=0`) skips recovery.
    pub stale_after: Option<Duration>,

    /// Repeat the stale recovery at this interval while running. Needs `stale_after`.
    pub reap_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_names: vec![DEFAULT_QUEUES.to_string()],
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            claim_timeout: Duration::from_millis(DEFAULT_CLAIM_TIMEOUT_MS),
            store_retry_attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            store_retry_base: Duration::from_millis(DEFAULT_STORE_RETRY_BASE_MS),
            handler_timeout: None,
            max_concurrent_handlers: None,
            stale_after: Some(Duration::from_millis(DEFAULT_STALE_AFTER_MS)),
            reap_interval: None,
        }
    }
}

impl WorkerConfig {
    /// Read `SPOOL_*` variables from the process environment.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `SPOOL_QUEUES` | `queue_names` (comma separated) |
    /// | `SPOOL_MAX_ATTEMPTS` | `max_attempts` |
    /// | `SPOOL_BASE_BACKOFF_MS` | `base_backoff` |
    /// | `SPOOL_MAX_BACKOFF_MS` | `max_backoff` |
    /// | `SPOOL_CLAIM_TIMEOUT_MS` | `claim_timeout` |
    /// | `SPOOL_STORE_RETRY_ATTEMPTS` | `store_retry_attempts` |
    /// | `SPOOL_STORE_RETRY_BASE_MS` | `store_retry_base` |
    /// | `SPOOL_HANDLER_TIMEOUT_MS` | `handler_timeout` |
    /// | `SPOOL_MAX_CONCURRENT_HANDLERS` | `max_concurrent_handlers` |
    /// | `SPOOL_STALE_AFTER_MS` | `stale_after` |
    /// | `SPOOL_REAP_INTERVAL_MS` | `reap_interval` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`WorkerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let queue_names = match get("SPOOL_QUEUES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.queue_names,
        };

        let config = Self {
            queue_names,
            max_attempts: parse(&get, "SPOOL_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            base_backoff: millis(&get, "SPOOL_BASE_BACKOFF_MS")?.unwrap_or(defaults.base_backoff),
            max_backoff: millis(&get, "SPOOL_MAX_BACKOFF_MS")?.unwrap_or(defaults.max_backoff),
            claim_timeout: millis(&get, "SPOOL_CLAIM_TIMEOUT_MS")?
                .unwrap_or(defaults.claim_timeout),
            store_retry_attempts: parse(&get, "SPOOL_STORE_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.store_retry_attempts),
            store_retry_base: millis(&get, "SPOOL_STORE_RETRY_BASE_MS")?
                .unwrap_or(defaults.store_retry_base),
            handler_timeout: millis(&get, "SPOOL_HANDLER_TIMEOUT_MS")?,
            max_concurrent_handlers: parse(&get, "SPOOL_MAX_CONCURRENT_HANDLERS")?,
            stale_after: match millis(&get, "SPOOL_STALE_AFTER_MS")? {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => defaults.stale_after,
            },
            reap_interval: millis(&get, "SPOOL_REAP_INTERVAL_MS")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.claim_timeout.is_zero() {
            return Err(ConfigError::Invalid("claim_timeout must be positive".into()));
        }
        if self.base_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "base_backoff ({:?}) exceeds max_backoff ({:?})",
                self.base_backoff, self.max_backoff
            )));
        }
        if self.store_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store_retry_attempts must be at least 1".into(),
            ));
        }
        if self.handler_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid("handler_timeout must be positive".into()));
        }
        if self.max_concurrent_handlers == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrent_handlers must be at least 1".into(),
            ));
        }
        match (self.stale_after, self.reap_interval) {
            (_, Some(interval)) if interval.is_zero() => Err(ConfigError::Invalid(
                "reap_interval must be positive".into(),
            )),
            (None, Some(_)) => Err(ConfigError::Invalid(
                "reap_interval needs stale_after".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_backoff, self.max_backoff)
    }
}

fn parse<T, G>(get: &G, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                expected: "a non-negative integer",
            })
        })
        .transpose()
}

fn millis<G>(get: &G, key: &str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, G>(get, key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry_policy(), RetryPolicy::default_v1());
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("SPOOL_QUEUES", " billing, emails ,,"),
            ("SPOOL_MAX_ATTEMPTS", "3"),
            ("SPOOL_BASE_BACKOFF_MS", "10"),
            ("SPOOL_MAX_BACKOFF_MS", "40"),
            ("SPOOL_CLAIM_TIMEOUT_MS", "250"),
            ("SPOOL_STORE_RETRY_ATTEMPTS", "2"),
            ("SPOOL_STORE_RETRY_BASE_MS", "5"),
            ("SPOOL_HANDLER_TIMEOUT_MS", "30000"),
            ("SPOOL_MAX_CONCURRENT_HANDLERS", "8"),
            ("SPOOL_STALE_AFTER_MS", "60000"),
            ("SPOOL_REAP_INTERVAL_MS", "15000"),
        ]))
        .unwrap();

        assert_eq!(config.queue_names, vec!["billing", "emails"]);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_backoff, Duration::from_millis(10));
        assert_eq!(config.max_backoff, Duration::from_millis(40));
        assert_eq!(config.claim_timeout, Duration::from_millis(250));
        assert_eq!(config.store_retry_attempts, 2);
        assert_eq!(config.store_retry_base, Duration::from_millis(5));
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_concurrent_handlers, Some(8));
        assert_eq!(config.stale_after, Some(Duration::from_secs(60)));
        assert_eq!(config.reap_interval, Some(Duration::from_secs(15)));
    }

    #[test]
    fn stale_recovery_is_on_by_default_and_zero_turns_it_off() {
        let config = WorkerConfig::default();
        assert_eq!(config.stale_after, Some(Duration::from_secs(600)));

        let off = WorkerConfig::from_lookup(lookup(&[("SPOOL_STALE_AFTER_MS", "0")])).unwrap();
        assert_eq!(off.stale_after, None);

        let reaping_without_recovery = WorkerConfig::from_lookup(lookup(&[
            ("SPOOL_STALE_AFTER_MS", "0"),
            ("SPOOL_REAP_INTERVAL_MS", "1000"),
        ]));
        assert!(matches!(reaping_without_recovery, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unparsable_number_names_the_variable() {
        let err = WorkerConfig::from_lookup(lookup(&[("SPOOL_MAX_ATTEMPTS", "three")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "SPOOL_MAX_ATTEMPTS".into(),
                value: "three".into(),
                expected: "a non-negative integer",
            }
        );
    }

    #[test]
    fn rejects_insane_values() {
        let cases = [
            WorkerConfig { max_attempts: 0, ..Default::default() },
            WorkerConfig { claim_timeout: Duration::ZERO, ..Default::default() },
            WorkerConfig {
                base_backoff: Duration::from_secs(10),
                max_backoff: Duration::from_secs(1),
                ..Default::default()
            },
            WorkerConfig { store_retry_attempts: 0, ..Default::default() },
            WorkerConfig { handler_timeout: Some(Duration::ZERO), ..Default::default() },
            WorkerConfig { max_concurrent_handlers: Some(0), ..Default::default() },
            WorkerConfig {
                stale_after: None,
                reap_interval: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))), "{config:?}");
        }
    }
}
