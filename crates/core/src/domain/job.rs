// Job Domain Model - persisted unit of deferred work

use crate::domain::error::{DomainError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job ID (UUID v4)
pub type JobId = String;

/// Listener name a job is dispatched to
pub type ListenerName = String;

/// Job Status
///
/// `Inited` is the in-memory claimed state; it is never written back to
/// storage, so a persisted record is always `Active` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Inited,
    Failed,
    Removed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Inited => "inited",
            JobStatus::Failed => "failed",
            JobStatus::Removed => "removed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(JobStatus::Active),
            "inited" => Ok(JobStatus::Inited),
            "failed" => Ok(JobStatus::Failed),
            "removed" => Ok(JobStatus::Removed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Job Payload (key-value map that survives a restart)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(Map<String, Value>);

impl JobPayload {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a payload from any serializable struct (must serialize to an object)
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        match serde_json::to_value(value) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(DomainError::InvalidPayload(format!(
                "expected an object, got {}",
                other
            ))),
            Err(e) => Err(DomainError::InvalidPayload(e.to_string())),
        }
    }

    /// Decode the payload into a typed struct
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| DomainError::InvalidPayload(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Job Entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "_id")]
    pub id: JobId,
    pub run_at: i64, // epoch ms
    pub listener: ListenerName,
    pub payload: JobPayload,
    pub retry_count: i64,
    pub status: JobStatus,
    /// Correlation key for bulk cancellation (e.g. all jobs of one unit of work)
    pub group: Option<String>,
    pub created_at: i64, // epoch ms
}

impl Job {
    /// Create a new active job
    ///
    /// ID and creation time are injected (IdProvider / TimeProvider),
    /// never generated here.
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        run_at: i64,
        listener: impl Into<String>,
        payload: JobPayload,
    ) -> Self {
        Self {
            id: id.into(),
            run_at,
            listener: listener.into(),
            payload,
            retry_count: 0,
            status: JobStatus::Active,
            group: None,
            created_at,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Whether the job is due at `now_millis`
    pub fn is_due(&self, now_millis: i64) -> bool {
        self.status == JobStatus::Active && self.run_at <= now_millis
    }

    /// Active -> Inited (claimed for dispatch)
    pub fn claim(&mut self) -> Result<()> {
        if self.status != JobStatus::Active {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: JobStatus::Inited.to_string(),
            });
        }
        self.status = JobStatus::Inited;
        Ok(())
    }

    /// Mark as failed. Returns false when the job was already removed.
    pub fn mark_failed(&mut self) -> bool {
        if self.status == JobStatus::Removed {
            return false;
        }
        self.status = JobStatus::Failed;
        true
    }

    /// Mark as removed (persisted record deleted)
    pub fn mark_removed(&mut self) {
        self.status = JobStatus::Removed;
    }
}
