// JobBuilder - describes a job before it is persisted

use super::SchedulerError;
use crate::domain::{DomainError, Job, JobId, JobPayload};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
enum Schedule {
    At(i64),
    After(Duration),
}

/// ```text
/// scheduler.new_job(
///     JobBuilder::new()
///         .listener("cancel_withdraw")
///         .run_after(Duration::from_secs(3600))
///         .payload_from(&CancelWithdraw { transaction_id })?
///         .group(transaction_id),
/// ).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    schedule: Option<Schedule>,
    listener: Option<String>,
    payload: JobPayload,
    group: Option<String>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(Schedule::At(at.timestamp_millis()));
        self
    }

    /// Due `delay` after the job is created
    pub fn run_after(mut self, delay: Duration) -> Self {
        self.schedule = Some(Schedule::After(delay));
        self
    }

    pub fn listener(mut self, name: impl Into<String>) -> Self {
        self.listener = Some(name.into());
        self
    }

    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = JobPayload::new(payload);
        self
    }

    pub fn payload_from<T: Serialize>(mut self, value: &T) -> Result<Self, SchedulerError> {
        self.payload = JobPayload::from_serialize(value)?;
        Ok(self)
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub(crate) fn build(self, id: JobId, now_millis: i64) -> Result<Job, SchedulerError> {
        let listener = match self.listener {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                return Err(DomainError::ValidationError(
                    "job listener name is required".to_string(),
                )
                .into())
            }
        };

        let run_at = match self.schedule {
            Some(Schedule::At(at)) => at,
            Some(Schedule::After(delay)) => {
                now_millis.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
            }
            None => now_millis,
        };

        let job = Job::new(id, now_millis, run_at, listener, self.payload);
        Ok(match self.group {
            Some(group) => job.with_group(group),
            None => job,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_after_is_relative_to_creation() {
        let job = JobBuilder::new()
            .listener("notify")
            .run_after(Duration::from_secs(2))
            .build("j1".into(), 10_000)
            .unwrap();
        assert_eq!(job.run_at, 12_000);
        assert_eq!(job.created_at, 10_000);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_defaults_to_due_now() {
        let job = JobBuilder::new()
            .listener("notify")
            .group("tx-1")
            .build("j1".into(), 500)
            .unwrap();
        assert_eq!(job.run_at, 500);
        assert_eq!(job.group.as_deref(), Some("tx-1"));
    }

    #[test]
    fn test_listener_is_required() {
        let err = JobBuilder::new().build("j1".into(), 0).unwrap_err();
        assert!(matches!(err, SchedulerError::Domain(DomainError::ValidationError(_))));
    }

    #[test]
    fn test_payload_from_rejects_non_objects() {
        assert!(JobBuilder::new().payload_from(&json!([1, 2])).is_err());
        let builder = JobBuilder::new()
            .payload_from(&json!({"transaction_id": "t-1"}))
            .unwrap();
        assert_eq!(builder.payload.get("transaction_id"), Some(&json!("t-1")));
    }
}
