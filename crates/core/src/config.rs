// Service configuration (all defaults come from application::constants)

use crate::application::constants::*;
use std::time::Duration;

/// Transaction coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Attempts per compensating action before rollback gives up on it
    pub retry_budget: usize,
    /// Deadline for every single storage call
    pub operation_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_ROLLBACK_RETRY_BUDGET,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Job scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    /// Max due jobs loaded per poll pass
    pub batch_size: usize,
    /// `retry()` calls allowed before a job is failed for good
    pub max_retries: i64,
    /// In-flight claims older than this are released (None = never)
    pub claim_lease: Option<Duration>,
    /// Attempts per failed-job deletion within one sweep
    pub sweep_retry_budget: usize,
    /// Capacity of the claim-set command channel
    pub command_capacity: usize,
    pub operation_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_JOB_POLL_INTERVAL,
            sweep_interval: DEFAULT_JOB_SWEEP_INTERVAL,
            batch_size: DEFAULT_JOB_BATCH_SIZE,
            max_retries: DEFAULT_JOB_MAX_RETRIES,
            claim_lease: Some(DEFAULT_JOB_CLAIM_LEASE),
            sweep_retry_budget: DEFAULT_SWEEP_RETRY_BUDGET,
            command_capacity: DEFAULT_CHANNEL_CAPACITY,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

/// Retry-queue writer settings
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Collection the queued records are persisted into
    pub collection: String,
    pub queue_capacity: usize,
    /// Total persistence attempts per item before it is dropped
    pub max_retry_count: u32,
    pub operation_timeout: Duration,
}

impl WriterConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            queue_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_retry_count: DEFAULT_WRITER_MAX_RETRY_COUNT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}
