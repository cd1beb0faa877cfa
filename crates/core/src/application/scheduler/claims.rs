// Claim set - the in-flight and failed job sets, owned by one task
//
// Every mutation and snapshot is a message to the owner loop, so the two
// maps are never shared and need no lock.

use super::SchedulerError;
use crate::domain::{Job, JobId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Token of one claim; a release only applies to the claim it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Lease(u64);

enum Command {
    Claim {
        id: JobId,
        now_millis: i64,
        reply: oneshot::Sender<Option<Lease>>,
    },
    Release {
        id: JobId,
        lease: Lease,
    },
    MarkFailed {
        job: Job,
        lease: Lease,
    },
    RemoveFailed {
        id: JobId,
    },
    SeedFailed {
        jobs: Vec<Job>,
        reply: oneshot::Sender<usize>,
    },
    Excluded {
        now_millis: i64,
        reply: oneshot::Sender<Vec<JobId>>,
    },
    InFlight {
        reply: oneshot::Sender<Vec<JobId>>,
    },
    Failed {
        reply: oneshot::Sender<Vec<Job>>,
    },
}

struct ClaimState {
    lease_millis: Option<i64>,
    next_lease: u64,
    in_flight: HashMap<JobId, (Lease, i64)>,
    failed: HashMap<JobId, Job>,
}

impl ClaimState {
    fn new(lease: Option<Duration>) -> Self {
        Self {
            lease_millis: lease.map(|l| i64::try_from(l.as_millis()).unwrap_or(i64::MAX)),
            next_lease: 1,
            in_flight: HashMap::new(),
            failed: HashMap::new(),
        }
    }

    fn expire(&mut self, now_millis: i64) {
        let Some(lease_millis) = self.lease_millis else {
            return;
        };
        self.in_flight.retain(|id, (_, claimed_at)| {
            let live = now_millis.saturating_sub(*claimed_at) < lease_millis;
            if !live {
                warn!(
                    job_id = %id,
                    held_ms = now_millis.saturating_sub(*claimed_at),
                    "Claim lease expired, job can be dispatched again"
                );
            }
            live
        });
    }

    fn release(&mut self, id: &JobId, lease: Lease) {
        if matches!(self.in_flight.get(id), Some((held, _)) if *held == lease) {
            self.in_flight.remove(id);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Claim {
                id,
                now_millis,
                reply,
            } => {
                self.expire(now_millis);
                let granted = if self.in_flight.contains_key(&id) || self.failed.contains_key(&id)
                {
                    None
                } else {
                    let lease = Lease(self.next_lease);
                    self.next_lease += 1;
                    self.in_flight.insert(id.clone(), (lease, now_millis));
                    Some(lease)
                };
                debug!(job_id = %id, granted = granted.is_some(), "Claim requested");
                let _ = reply.send(granted);
            }
            Command::Release { id, lease } => self.release(&id, lease),
            Command::MarkFailed { job, lease } => {
                self.release(&job.id, lease);
                self.failed.insert(job.id.clone(), job);
            }
            Command::RemoveFailed { id } => {
                self.failed.remove(&id);
            }
            Command::SeedFailed { jobs, reply } => {
                let mut added = 0;
                for job in jobs {
                    if !self.failed.contains_key(&job.id) {
                        self.failed.insert(job.id.clone(), job);
                        added += 1;
                    }
                }
                let _ = reply.send(added);
            }
            Command::Excluded { now_millis, reply } => {
                self.expire(now_millis);
                let ids = self
                    .in_flight
                    .keys()
                    .chain(self.failed.keys())
                    .cloned()
                    .collect();
                let _ = reply.send(ids);
            }
            Command::InFlight { reply } => {
                let _ = reply.send(self.in_flight.keys().cloned().collect());
            }
            Command::Failed { reply } => {
                let _ = reply.send(self.failed.values().cloned().collect());
            }
        }
    }
}

/// Handle to the owner loop
#[derive(Clone)]
pub(crate) struct ClaimSet {
    tx: mpsc::Sender<Command>,
}

impl ClaimSet {
    /// Spawn the owner loop; it stops once every handle is dropped
    pub(crate) fn spawn(capacity: usize, lease: Option<Duration>) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut state = ClaimState::new(lease);
            while let Some(command) = rx.recv().await {
                state.handle(command);
            }
            debug!("Claim set loop stopped");
        });
        Self { tx }
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::ClaimLoopClosed)
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| SchedulerError::ClaimLoopClosed)
    }

    /// Atomically claim `id`; None when it is already in flight or failed
    pub(crate) async fn claim(
        &self,
        id: JobId,
        now_millis: i64,
    ) -> Result<Option<Lease>, SchedulerError> {
        self.ask(|reply| Command::Claim {
            id,
            now_millis,
            reply,
        })
        .await
    }

    pub(crate) async fn release(&self, id: JobId, lease: Lease) -> Result<(), SchedulerError> {
        self.send(Command::Release { id, lease }).await
    }

    pub(crate) async fn mark_failed(&self, job: Job, lease: Lease) -> Result<(), SchedulerError> {
        self.send(Command::MarkFailed { job, lease }).await
    }

    pub(crate) async fn remove_failed(&self, id: JobId) -> Result<(), SchedulerError> {
        self.send(Command::RemoveFailed { id }).await
    }

    /// Add failed jobs loaded from storage; returns how many were new
    pub(crate) async fn seed_failed(&self, jobs: Vec<Job>) -> Result<usize, SchedulerError> {
        self.ask(|reply| Command::SeedFailed { jobs, reply }).await
    }

    /// Ids a poll must skip: live claims plus failed jobs awaiting the sweep
    pub(crate) async fn excluded(&self, now_millis: i64) -> Result<Vec<JobId>, SchedulerError> {
        self.ask(|reply| Command::Excluded { now_millis, reply })
            .await
    }

    pub(crate) async fn in_flight(&self) -> Result<Vec<JobId>, SchedulerError> {
        self.ask(|reply| Command::InFlight { reply }).await
    }

    pub(crate) async fn failed(&self) -> Result<Vec<Job>, SchedulerError> {
        self.ask(|reply| Command::Failed { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobPayload;

    #[tokio::test]
    async fn test_second_claim_is_refused() {
        let claims = ClaimSet::spawn(8, None);
        assert!(claims.claim("a".into(), 0).await.unwrap().is_some());
        assert!(claims.claim("a".into(), 0).await.unwrap().is_none());
        assert_eq!(claims.in_flight().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_claim() {
        let claims = ClaimSet::spawn(8, Some(Duration::from_millis(100)));
        let old = claims.claim("a".into(), 0).await.unwrap().unwrap();
        let new = claims.claim("a".into(), 500).await.unwrap().unwrap();
        assert_ne!(old, new);

        claims.release("a".into(), old).await.unwrap();
        assert_eq!(claims.in_flight().await.unwrap(), vec!["a".to_string()]);

        claims.release("a".into(), new).await.unwrap();
        assert!(claims.in_flight().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_jobs_stay_excluded_until_removed() {
        let claims = ClaimSet::spawn(8, None);
        let lease = claims.claim("a".into(), 0).await.unwrap().unwrap();
        let job = Job::new("a", 0, 0, "notify", JobPayload::default());

        claims.mark_failed(job, lease).await.unwrap();
        assert!(claims.in_flight().await.unwrap().is_empty());
        assert_eq!(claims.excluded(0).await.unwrap(), vec!["a".to_string()]);
        assert!(claims.claim("a".into(), 0).await.unwrap().is_none());

        claims.remove_failed("a".into()).await.unwrap();
        assert!(claims.failed().await.unwrap().is_empty());
        assert!(claims.excluded(0).await.unwrap().is_empty());
    }
}
