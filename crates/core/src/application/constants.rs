// Service constants (no magic values)
use std::time::Duration;

/// Deadline for one storage call (10s)
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per compensating action during rollback
pub const DEFAULT_ROLLBACK_RETRY_BUDGET: usize = 3;

/// Collection holding persisted jobs in a DocumentJobRepository
pub const DEFAULT_JOB_COLLECTION: &str = "cron_jobs";

/// How often due jobs are polled (5s)
pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How often the failed-set is swept (1 minute)
pub const DEFAULT_JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Due jobs loaded per poll pass
pub const DEFAULT_JOB_BATCH_SIZE: usize = 100;

/// retry() calls allowed per job
pub const DEFAULT_JOB_MAX_RETRIES: i64 = 5;

/// In-flight claim lease (10 minutes)
pub const DEFAULT_JOB_CLAIM_LEASE: Duration = Duration::from_secs(10 * 60);

/// Attempts per failed-job deletion in one sweep
pub const DEFAULT_SWEEP_RETRY_BUDGET: usize = 3;

/// Bounded channel / queue capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Persistence attempts per retry-queue item
pub const DEFAULT_WRITER_MAX_RETRY_COUNT: u32 = 5;

/// Capacity of each realtime topic's broadcast buffer
pub const REALTIME_TOPIC_CAPACITY: usize = 256;

/// Realtime topic checkers listen on
pub const CHECKERS_TOPIC: &str = "checkers";

/// Collection holding review tasks
pub const CHECKER_TASKS_COLLECTION: &str = "tasks";

/// Reference collections joined into published review tasks
pub const SELLERS_COLLECTION: &str = "sellers";
pub const CITIES_COLLECTION: &str = "cities";
