//! Job Scheduler - persisted, delayed jobs dispatched to named listeners
//!
//! Three loops cooperate:
//! - poll: loads due jobs (bounded batch), claims and dispatches them
//! - sweep: deletes the records of failed jobs
//! - claim set: sole owner of the in-flight and failed sets
//!
//! The claim-set loop is spawned by `Scheduler::new` so `poll_once` and
//! `sweep_failed_once` can be driven directly; `start` adds the two timers.

mod builder;
mod claims;
mod listener;

pub use builder::JobBuilder;
pub use listener::{JobContext, JobListener};

use crate::application::bounded;
use crate::application::shutdown::ShutdownToken;
use crate::config::SchedulerConfig;
use crate::domain::{DomainError, JobId, JobStatus};
use crate::port::{IdProvider, JobRepository, StoreError, TimeProvider};
use claims::ClaimSet;
use listener::FnListener;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no listener registered for `{0}`")]
    ListenerMissing(String),

    #[error("job {job_id} exhausted its {max_retries} retries")]
    RetryExhausted { job_id: JobId, max_retries: i64 },

    #[error("claim set loop stopped")]
    ClaimLoopClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub(crate) struct Inner {
    pub(crate) repo: Arc<dyn JobRepository>,
    pub(crate) config: SchedulerConfig,
    pub(crate) claims: ClaimSet,
    time: Arc<dyn TimeProvider>,
    ids: Arc<dyn IdProvider>,
    listeners: RwLock<HashMap<String, Arc<dyn JobListener>>>,
}

/// Cheap to clone; clones share listeners and claims
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Must be called inside a tokio runtime (spawns the claim-set loop)
    pub fn new(
        repo: Arc<dyn JobRepository>,
        time: Arc<dyn TimeProvider>,
        ids: Arc<dyn IdProvider>,
        config: SchedulerConfig,
    ) -> Self {
        let claims = ClaimSet::spawn(config.command_capacity, config.claim_lease);
        Self {
            inner: Arc::new(Inner {
                repo,
                config,
                claims,
                time,
                ids,
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register `listener` under `name`, replacing any earlier one
    pub fn on(&self, name: impl Into<String>, listener: Arc<dyn JobListener>) {
        let name = name.into();
        let replaced = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), listener)
            .is_some();
        debug!(listener = %name, replaced, "Job listener registered");
    }

    pub fn on_fn<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(name, Arc::new(FnListener(handler)));
    }

    fn listener(&self, name: &str) -> Option<Arc<dyn JobListener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Persist a new active job
    pub async fn new_job(&self, builder: JobBuilder) -> Result<JobId, SchedulerError> {
        let job = builder.build(self.inner.ids.generate_id(), self.inner.time.now_millis())?;
        bounded(self.inner.config.operation_timeout, self.inner.repo.insert(&job)).await?;
        info!(
            job_id = %job.id,
            listener = %job.listener,
            run_at = job.run_at,
            group = ?job.group,
            "Job scheduled"
        );
        Ok(job.id)
    }

    /// Delete every persisted job of `group`
    pub async fn remove_jobs_by_group(&self, group: &str) -> Result<u64, SchedulerError> {
        let removed = bounded(
            self.inner.config.operation_timeout,
            self.inner.repo.delete_by_group(group),
        )
        .await?;
        info!(group, removed, "Jobs removed by group");
        Ok(removed)
    }

    /// One poll pass; returns the number of jobs claimed
    pub async fn poll_once(&self) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let timeout = inner.config.operation_timeout;
        let now = inner.time.now_millis();

        let exclude = inner.claims.excluded(now).await?;
        let due = bounded(
            timeout,
            inner.repo.find_due(now, &exclude, inner.config.batch_size),
        )
        .await?;

        let mut claimed = 0;
        for candidate in due {
            let Some(lease) = inner.claims.claim(candidate.id.clone(), now).await? else {
                debug!(job_id = %candidate.id, "Job already claimed, skipping");
                continue;
            };

            // A concurrent pass may have finished the job between our read
            // and the claim
            let fresh = match bounded(timeout, inner.repo.find_by_id(&candidate.id)).await {
                Ok(Some(job)) if job.status == JobStatus::Active => job,
                Ok(_) => {
                    inner.claims.release(candidate.id.clone(), lease).await?;
                    continue;
                }
                Err(e) => {
                    inner.claims.release(candidate.id.clone(), lease).await?;
                    return Err(e.into());
                }
            };

            let mut job = fresh;
            job.claim()?;
            claimed += 1;
            self.dispatch(JobContext::new(job, lease, Arc::clone(&self.inner)))
                .await;
        }

        if claimed > 0 {
            debug!(claimed, "Poll pass dispatched jobs");
        }
        Ok(claimed)
    }

    async fn dispatch(&self, mut ctx: JobContext) {
        let job_id = ctx.job().id.clone();
        let listener_name = ctx.job().listener.clone();

        let Some(listener) = self.listener(&listener_name) else {
            let err = SchedulerError::ListenerMissing(listener_name.clone());
            warn!(job_id = %job_id, error = %err, "Failing job without a listener");
            ctx.mark_settled();
            if let Err(e) = ctx.fail().await {
                error!(job_id = %job_id, error = %e, "Could not fail job");
            }
            return;
        };

        debug!(job_id = %job_id, listener = %listener_name, "Dispatching job");
        let handle = tokio::spawn(async move { listener.handle(ctx).await });

        // A panicking listener only loses its own task
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(
                        job_id = %job_id,
                        listener = %listener_name,
                        panic = %panic_message(e.into_panic()),
                        "Job listener panicked"
                    );
                }
            }
        });
    }

    /// One sweep over the failed-set; returns the number of records removed
    pub async fn sweep_failed_once(&self) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let failed = inner.claims.failed().await?;
        let budget = inner.config.sweep_retry_budget.max(1);

        let mut removed = 0;
        for job in failed {
            let mut last_error = None;
            for attempt in 1..=budget {
                match bounded(inner.config.operation_timeout, inner.repo.delete(&job.id)).await {
                    Ok(_) => {
                        last_error = None;
                        break;
                    }
                    Err(e) => {
                        debug!(job_id = %job.id, attempt, error = %e, "Failed job delete attempt");
                        last_error = Some(e);
                    }
                }
            }

            match last_error {
                None => {
                    inner.claims.remove_failed(job.id.clone()).await?;
                    removed += 1;
                }
                Some(e) => error!(
                    job_id = %job.id,
                    attempts = budget,
                    error = %e,
                    "Could not delete failed job, keeping it for the next sweep"
                ),
            }
        }

        if removed > 0 {
            info!(removed, "Failed jobs swept");
        }
        Ok(removed)
    }

    /// Load jobs stored as failed into the failed-set so the sweep removes
    /// them; returns how many were added
    pub async fn recover_failed(&self) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let stored = bounded(inner.config.operation_timeout, inner.repo.find_failed()).await?;
        let added = inner.claims.seed_failed(stored).await?;
        if added > 0 {
            info!(recovered = added, "Stored failed jobs queued for the sweep");
        }
        Ok(added)
    }

    /// Spawn the poll and sweep loops; both stop on shutdown
    ///
    /// The sweep loop recovers stored failed jobs before its first sweep.
    pub fn start(&self, shutdown: ShutdownToken) -> Vec<JoinHandle<()>> {
        let poll = {
            let scheduler = self.clone();
            let period = self.inner.config.poll_interval;
            spawn_ticker("poll", period, shutdown.clone(), move || {
                let scheduler = scheduler.clone();
                async move { scheduler.poll_once().await.map(|_| ()) }
            })
        };
        let sweep = {
            let scheduler = self.clone();
            let period = self.inner.config.sweep_interval;
            let recovered = Arc::new(AtomicBool::new(false));
            spawn_ticker("sweep", period, shutdown, move || {
                let scheduler = scheduler.clone();
                let recovered = Arc::clone(&recovered);
                async move {
                    if !recovered.load(Ordering::Acquire) {
                        scheduler.recover_failed().await?;
                        recovered.store(true, Ordering::Release);
                    }
                    scheduler.sweep_failed_once().await.map(|_| ())
                }
            })
        };
        vec![poll, sweep]
    }

    pub async fn in_flight_ids(&self) -> Result<Vec<JobId>, SchedulerError> {
        self.inner.claims.in_flight().await
    }

    pub async fn failed_ids(&self) -> Result<Vec<JobId>, SchedulerError> {
        Ok(self
            .inner
            .claims
            .failed()
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect())
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownToken,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), SchedulerError>> + Send + 'static,
{
    // interval() rejects a zero period
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(loop_name = name, period_ms = period.as_millis() as u64, "Scheduler loop started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = pass().await {
                        error!(loop_name = name, error = %e, "Scheduler pass failed");
                    }
                }
            }
        }
        info!(loop_name = name, "Scheduler loop stopped");
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
