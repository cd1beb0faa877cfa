// Job listeners and the context handed to them

use super::claims::Lease;
use super::{Inner, SchedulerError};
use crate::application::bounded;
use crate::domain::{DomainError, Job, JobStatus};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handler registered under a listener name
///
/// A listener must settle its job with exactly one of `finish`, `failed`
/// or `retry`. An unsettled job stays claimed until its lease expires.
#[async_trait]
pub trait JobListener: Send + Sync {
    async fn handle(&self, ctx: JobContext);
}

pub(crate) struct FnListener<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> JobListener for FnListener<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) {
        (self.0)(ctx).await
    }
}

/// One dispatched job plus its claim
pub struct JobContext {
    job: Job,
    lease: Lease,
    inner: Arc<Inner>,
    settled: bool,
}

impl JobContext {
    pub(crate) fn new(job: Job, lease: Lease, inner: Arc<Inner>) -> Self {
        Self {
            job,
            lease,
            inner,
            settled: false,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Decode the payload into the caller's typed struct
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SchedulerError> {
        Ok(self.job.payload.decode()?)
    }

    /// Work done: delete the persisted record and release the claim
    ///
    /// When the delete fails the job is failed instead, so the sweep
    /// retries the cleanup.
    pub async fn finish(mut self) -> Result<(), SchedulerError> {
        self.settled = true;
        if self.job.status == JobStatus::Removed {
            return Ok(());
        }

        let timeout = self.inner.config.operation_timeout;
        match bounded(timeout, self.inner.repo.delete(&self.job.id)).await {
            Ok(_) => {
                self.job.mark_removed();
                self.inner
                    .claims
                    .release(self.job.id.clone(), self.lease)
                    .await?;
                info!(job_id = %self.job.id, listener = %self.job.listener, "Job finished");
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "Could not delete finished job, failing it");
                self.fail().await?;
                Err(e.into())
            }
        }
    }

    /// Give up on the job; the sweep deletes its record later
    pub async fn failed(mut self) -> Result<(), SchedulerError> {
        self.settled = true;
        self.fail().await
    }

    /// Release the claim so a later poll dispatches the job again
    ///
    /// Returns the new retry count. Past `max_retries` the job is failed
    /// and `RetryExhausted` is returned.
    pub async fn retry(mut self) -> Result<i64, SchedulerError> {
        self.settled = true;
        let max_retries = self.inner.config.max_retries;
        if self.job.retry_count >= max_retries {
            warn!(
                job_id = %self.job.id,
                retry = self.job.retry_count,
                max_retries,
                "Job retries exhausted"
            );
            self.fail().await?;
            return Err(SchedulerError::RetryExhausted {
                job_id: self.job.id.clone(),
                max_retries,
            });
        }

        let timeout = self.inner.config.operation_timeout;
        let count = bounded(timeout, self.inner.repo.increment_retry(&self.job.id))
            .await?
            .ok_or_else(|| DomainError::JobNotFound(self.job.id.clone()))?;
        self.job.retry_count = count;
        self.inner
            .claims
            .release(self.job.id.clone(), self.lease)
            .await?;

        info!(job_id = %self.job.id, retry = count, "Job scheduled for retry");
        Ok(count)
    }

    pub(crate) async fn fail(&mut self) -> Result<(), SchedulerError> {
        if !self.job.mark_failed() {
            return Ok(());
        }
        self.inner
            .claims
            .mark_failed(self.job.clone(), self.lease)
            .await?;

        let timeout = self.inner.config.operation_timeout;
        let persisted = bounded(
            timeout,
            self.inner.repo.update_status(&self.job.id, JobStatus::Failed),
        )
        .await?;
        debug!(job_id = %self.job.id, persisted, "Job marked failed");
        Ok(())
    }

    pub(crate) fn mark_settled(&mut self) {
        self.settled = true;
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                job_id = %self.job.id,
                listener = %self.job.listener,
                "Job context dropped unsettled, claim held until its lease expires"
            );
        }
    }
}
