//! Daemon settings read from `BULWARK_*` environment variables
//!
//! Anything unset falls back to the defaults in `bulwark_core::config`.

use anyhow::{Context, Result};
use bulwark_core::application::constants::CHECKER_TASKS_COLLECTION;
use bulwark_core::config::{SchedulerConfig, WriterConfig};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "~/.bulwark/bulwark.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: String,
    pub log_format: LogFormat,
    pub log_dir: Option<String>,
    pub scheduler: SchedulerConfig,
    pub writer: WriterConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup (the process env in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("BULWARK_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let db_path = shellexpand::tilde(&db_path).into_owned();

        let log_format = match lookup("BULWARK_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let log_dir = lookup("BULWARK_LOG_DIR").map(|dir| shellexpand::tilde(&dir).into_owned());

        let mut scheduler = SchedulerConfig::default();
        let mut writer = WriterConfig::new(CHECKER_TASKS_COLLECTION);

        if let Some(timeout) = parse_millis(&lookup, "BULWARK_OP_TIMEOUT_MS")? {
            scheduler.operation_timeout = timeout;
            writer.operation_timeout = timeout;
        }
        if let Some(interval) = parse_millis(&lookup, "BULWARK_JOB_POLL_INTERVAL_MS")? {
            scheduler.poll_interval = interval;
        }
        if let Some(interval) = parse_millis(&lookup, "BULWARK_JOB_SWEEP_INTERVAL_MS")? {
            scheduler.sweep_interval = interval;
        }
        if let Some(size) = parse(&lookup, "BULWARK_JOB_BATCH_SIZE")? {
            scheduler.batch_size = size;
        }
        if let Some(max) = parse(&lookup, "BULWARK_JOB_MAX_RETRIES")? {
            scheduler.max_retries = max;
        }
        // 0 disables lease expiry
        if let Some(lease) = parse::<u64, _>(&lookup, "BULWARK_JOB_CLAIM_LEASE_MS")? {
            scheduler.claim_lease = (lease > 0).then(|| Duration::from_millis(lease));
        }
        if let Some(max) = parse(&lookup, "BULWARK_WRITER_MAX_RETRY")? {
            writer.max_retry_count = max;
        }
        if let Some(capacity) = parse(&lookup, "BULWARK_WRITER_QUEUE_CAPACITY")? {
            writer.queue_capacity = capacity;
        }

        Ok(Self {
            db_path,
            log_format,
            log_dir,
            scheduler,
            writer,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {raw:?}"))
        })
        .transpose()
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, _>(lookup, key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        let defaults = SchedulerConfig::default();

        assert!(settings.db_path.ends_with(".bulwark/bulwark.db"));
        assert!(!settings.db_path.starts_with('~'));
        assert_eq!(settings.log_format, LogFormat::Pretty);
        assert_eq!(settings.scheduler.poll_interval, defaults.poll_interval);
        assert_eq!(settings.scheduler.claim_lease, defaults.claim_lease);
        assert_eq!(settings.writer.collection, CHECKER_TASKS_COLLECTION);
    }

    #[test]
    fn test_overrides() {
        let settings = settings(&[
            ("BULWARK_DB_PATH", "/tmp/b.db"),
            ("BULWARK_LOG_FORMAT", "json"),
            ("BULWARK_JOB_POLL_INTERVAL_MS", "250"),
            ("BULWARK_JOB_BATCH_SIZE", "7"),
            ("BULWARK_JOB_MAX_RETRIES", "2"),
            ("BULWARK_JOB_CLAIM_LEASE_MS", "0"),
            ("BULWARK_OP_TIMEOUT_MS", "1500"),
            ("BULWARK_WRITER_MAX_RETRY", "9"),
            ("BULWARK_WRITER_QUEUE_CAPACITY", "16"),
        ])
        .unwrap();

        assert_eq!(settings.db_path, "/tmp/b.db");
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.scheduler.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.scheduler.batch_size, 7);
        assert_eq!(settings.scheduler.max_retries, 2);
        assert_eq!(settings.scheduler.claim_lease, None);
        assert_eq!(
            settings.scheduler.operation_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(settings.writer.operation_timeout, Duration::from_millis(1500));
        assert_eq!(settings.writer.max_retry_count, 9);
        assert_eq!(settings.writer.queue_capacity, 16);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = settings(&[("BULWARK_JOB_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("BULWARK_JOB_BATCH_SIZE"));
    }
}
