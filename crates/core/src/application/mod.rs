// Application Layer - Use Cases and Services

pub mod checker_task;
pub mod checking_list;
pub mod constants;
pub mod realtime;
pub mod scheduler;
pub mod shutdown;
pub mod transaction;
pub mod writer;

// Re-exports
pub use checker_task::CheckerTaskService;
pub use checking_list::CheckingList;
pub use realtime::RealtimeHub;
pub use scheduler::{JobBuilder, JobContext, JobListener, Scheduler, SchedulerError};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use transaction::{
    RestoreFields, ReverseUpdate, RollbackReport, TransactionCoordinator, TransactionError,
    TransactionModel,
};
pub use writer::{FollowUp, Lookup, RetryQueueWriter, WriterError, WriterStats};

use crate::port::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;

/// Run a storage call under a hard deadline; a timeout is a storage failure
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
