//! Concurrent units of work against a file-backed, multi-connection database

use std::sync::Arc;
use std::time::Duration;

use bulwark_core::application::constants::CHECKER_TASKS_COLLECTION;
use bulwark_core::application::{
    shutdown_channel, CheckerTaskService, JobBuilder, RealtimeHub, RollbackReport, Scheduler,
    TransactionCoordinator, TransactionError, TransactionModel,
};
use bulwark_core::config::{CoordinatorConfig, SchedulerConfig, WriterConfig};
use bulwark_core::domain::document::{id_filter, into_document};
use bulwark_core::domain::{Document, Job, JobPayload, JobStatus};
use bulwark_core::port::id_provider::UuidProvider;
use bulwark_core::port::time_provider::SystemTimeProvider;
use bulwark_core::port::{DocumentStore, JobRepository};
use bulwark_infra_sqlite::{create_pool, run_migrations, SqliteDocumentStore, SqliteJobRepository};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

const WALLETS: usize = 100;

fn doc(value: Value) -> Document {
    into_document(value).unwrap()
}

/// Document store and job repository sharing one pool on a database file
async fn open(dir: &TempDir) -> (Arc<SqliteDocumentStore>, Arc<SqliteJobRepository>) {
    let path = dir.path().join("bulwark.db");
    let pool = create_pool(&path.to_string_lossy()).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (
        Arc::new(SqliteDocumentStore::new(pool.clone(), Arc::new(UuidProvider))),
        Arc::new(SqliteJobRepository::new(pool)),
    )
}

async fn seeded_store(dir: &TempDir) -> Arc<SqliteDocumentStore> {
    let (store, _) = open(dir).await;
    let wallets = (0..WALLETS)
        .map(|n| doc(json!({"_id": format!("w{n}"), "balance": 100})))
        .collect();
    store.insert_many("wallets", wallets).await.unwrap();
    store
}

enum Settled {
    Committed(usize),
    RolledBack(RollbackReport),
}

/// Debit one wallet and record the movement; `fail` ends the unit of work
/// with a miss on a wallet that does not exist
async fn debit(
    store: Arc<SqliteDocumentStore>,
    wallet: String,
    fail: bool,
) -> Result<Settled, TransactionError> {
    let mut tx = TransactionCoordinator::new(store, CoordinatorConfig::default());
    let unit = async {
        tx.collection("wallets")
            .update_one(
                TransactionModel::new()
                    .filter(id_filter(&wallet))
                    .update(doc(json!({"$inc": {"balance": -10}})))
                    .rollback_update(doc(json!({"$inc": {"balance": 10}}))),
            )
            .await?;
        tx.collection("movements")
            .insert_one(
                TransactionModel::new().document(doc(json!({"wallet": wallet, "amount": 10}))),
            )
            .await?;
        if fail {
            tx.collection("wallets")
                .find_one_and_delete(TransactionModel::new().filter(id_filter("missing")))
                .await?;
        }
        Ok::<_, TransactionError>(())
    }
    .await;

    match unit {
        Ok(()) => match tx.commit() {
            Ok(actions) => Ok(Settled::Committed(actions)),
            Err(_) => unreachable!("commit after a successful unit of work"),
        },
        Err(_) => tx.rollback().await.map(Settled::RolledBack),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_coordinators_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir).await;

    let handles: Vec<_> = (0..WALLETS)
        .map(|n| tokio::spawn(debit(store.clone(), format!("w{n}"), false)))
        .collect();
    let mut failures = Vec::new();
    for handle in handles {
        if let Err(e) = handle.await.unwrap() {
            failures.push(e.to_string());
        }
    }
    assert!(failures.is_empty(), "failed units of work: {failures:?}");

    let wallets = store.find("wallets", &Document::new(), None).await.unwrap();
    assert!(wallets.iter().all(|w| w["balance"] == json!(90)));
    let movements = store.find("movements", &Document::new(), None).await.unwrap();
    assert_eq!(movements.len(), WALLETS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rollbacks_complete_alongside_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir).await;

    let handles: Vec<_> = (0..WALLETS)
        .map(|n| tokio::spawn(debit(store.clone(), format!("w{n}"), n % 2 == 1)))
        .collect();
    for (n, handle) in handles.into_iter().enumerate() {
        match handle.await.unwrap() {
            Ok(Settled::Committed(actions)) => {
                assert_eq!(n % 2, 0, "wallet w{n} committed");
                assert_eq!(actions, 2);
            }
            Ok(Settled::RolledBack(report)) => {
                assert_eq!(n % 2, 1, "wallet w{n} rolled back");
                assert_eq!(report.reverted, 2);
                // Only the planned miss, never a lock error
                assert!(
                    matches!(report.cause, Some(TransactionError::NoMatch { .. })),
                    "wallet w{n}: {:?}",
                    report.cause
                );
            }
            Err(e) => panic!("wallet w{n}: {e}"),
        }
    }

    for n in 0..WALLETS {
        let wallet = store
            .find_one("wallets", &id_filter(&format!("w{n}")))
            .await
            .unwrap()
            .unwrap();
        let expected = if n % 2 == 1 { 100 } else { 90 };
        assert_eq!(wallet["balance"], json!(expected), "wallet w{n}");
    }
    let movements = store.find("movements", &Document::new(), None).await.unwrap();
    assert_eq!(movements.len(), WALLETS / 2);
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("listener did not report in time")
        .expect("listener channel closed")
}

fn fast_loops() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(10),
        ..SchedulerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduler_polls_alongside_writer_inserts() {
    const JOBS: usize = 50;
    let dir = tempfile::tempdir().unwrap();
    let (store, repo) = open(&dir).await;

    let hub = Arc::new(RealtimeHub::default());
    let (service, writer_handle) = CheckerTaskService::spawn(
        store.clone(),
        hub,
        Arc::new(UuidProvider),
        WriterConfig::new(CHECKER_TASKS_COLLECTION),
    );

    let scheduler = Scheduler::new(
        repo.clone(),
        Arc::new(SystemTimeProvider),
        Arc::new(UuidProvider),
        fast_loops(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.on_fn("notify", move |ctx| {
        let tx = tx.clone();
        async move {
            let id = ctx.job().id.clone();
            ctx.finish().await.unwrap();
            tx.send(id).unwrap();
        }
    });
    let (stop, token) = shutdown_channel();
    let handles = scheduler.start(token);

    let mut scheduled = Vec::with_capacity(JOBS);
    for n in 0..JOBS {
        scheduled.push(
            scheduler
                .new_job(JobBuilder::new().listener("notify"))
                .await
                .unwrap(),
        );
        service
            .auction(&format!("auction-{n}"), "ends soon")
            .unwrap();
    }

    let mut finished = Vec::with_capacity(JOBS);
    for _ in 0..JOBS {
        finished.push(recv(&mut rx).await);
    }
    finished.sort();
    scheduled.sort();
    assert_eq!(finished, scheduled);
    for id in &scheduled {
        assert!(repo.find_by_id(id).await.unwrap().is_none(), "job {id} left behind");
    }

    stop.shutdown();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
    drop(scheduler);
    drop(service);
    tokio::time::timeout(Duration::from_secs(10), writer_handle)
        .await
        .unwrap()
        .unwrap();

    let tasks = store
        .find(CHECKER_TASKS_COLLECTION, &Document::new(), None)
        .await
        .unwrap();
    assert_eq!(tasks.len(), JOBS);
}

#[tokio::test]
async fn test_failed_job_is_swept_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let (_, repo) = open(&dir).await;
        let scheduler = Scheduler::new(
            repo.clone(),
            Arc::new(SystemTimeProvider),
            Arc::new(UuidProvider),
            SchedulerConfig::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.on_fn("broken", move |ctx| {
            let tx = tx.clone();
            async move {
                tx.send(ctx.failed().await.is_ok()).unwrap();
            }
        });
        let id = scheduler
            .new_job(JobBuilder::new().listener("broken"))
            .await
            .unwrap();
        assert_eq!(scheduler.poll_once().await.unwrap(), 1);
        assert!(recv(&mut rx).await);
        // Stopped before any sweep ran
        id
    };

    let (_, repo) = open(&dir).await;
    let stored = repo.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    // A stored pending job must survive the sweep
    let pending = Job::new("pending", 0, i64::MAX, "notify", JobPayload::default());
    repo.insert(&pending).await.unwrap();

    let scheduler = Scheduler::new(
        repo.clone(),
        Arc::new(SystemTimeProvider),
        Arc::new(UuidProvider),
        fast_loops(),
    );
    let (stop, token) = shutdown_channel();
    let handles = scheduler.start(token);

    tokio::time::timeout(Duration::from_secs(5), async {
        while repo.find_by_id(&id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failed job was never swept");
    assert!(repo.find_by_id(&pending.id).await.unwrap().is_some());

    stop.shutdown();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
