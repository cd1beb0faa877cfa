//! Bulwark - Main Entry Point
//! Job scheduler + checker task writer over SQLite

mod logging;
mod settings;

use anyhow::Result;
use bulwark_core::application::{shutdown_channel, CheckerTaskService, RealtimeHub, Scheduler};
use bulwark_core::port::id_provider::UuidProvider;
use bulwark_core::port::time_provider::SystemTimeProvider;
use bulwark_infra_sqlite::{create_pool, run_migrations, SqliteDocumentStore, SqliteJobRepository};
use serde::Deserialize;
use settings::Settings;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listener retracting a checker task nobody confirmed in time
const EXPIRE_CHECKER_TASK: &str = "expire-checker-task";

#[derive(Debug, Deserialize)]
struct ExpireCheckerTask {
    task_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let settings = Settings::from_env()?;
    let _log_guard = logging::init(&settings)?;

    info!("Bulwark v{} starting...", VERSION);

    // 2. Database
    if let Some(parent) = Path::new(&settings.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    info!(db_path = %settings.db_path, "Initializing database...");

    let pool = create_pool(&settings.db_path)
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    // 3. Dependencies (DI wiring)
    let time_provider = Arc::new(SystemTimeProvider);
    let id_provider = Arc::new(UuidProvider);
    let documents = Arc::new(SqliteDocumentStore::new(pool.clone(), id_provider.clone()));
    let job_repo = Arc::new(SqliteJobRepository::new(pool.clone()));
    let hub = Arc::new(RealtimeHub::default());

    // 4. Checker task writer
    let (checker_tasks, writer_handle) = CheckerTaskService::spawn(
        documents,
        hub,
        id_provider.clone(),
        settings.writer.clone(),
    );
    let checker_tasks = Arc::new(checker_tasks);

    // 5. Scheduler with its built-in listeners
    let scheduler = Scheduler::new(
        job_repo,
        time_provider,
        id_provider,
        settings.scheduler.clone(),
    );
    register_listeners(&scheduler, &checker_tasks);

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let loop_handles = scheduler.start(shutdown_rx);

    info!("System ready. Waiting for jobs...");
    info!("Press Ctrl+C to shutdown");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received. Exiting gracefully...");

    // 7. Graceful shutdown: stop the loops, then let the writer drain
    shutdown_tx.shutdown();
    for handle in loop_handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Scheduler loop did not stop in time");
        }
    }
    drop(scheduler);
    drop(checker_tasks);

    info!("Draining checker task writer...");
    if tokio::time::timeout(SHUTDOWN_GRACE, writer_handle)
        .await
        .is_err()
    {
        warn!("Checker task writer did not drain in time");
    }

    pool.close().await;
    info!("Shutdown complete.");

    Ok(())
}

fn register_listeners(scheduler: &Scheduler, checker_tasks: &Arc<CheckerTaskService>) {
    let checker_tasks = Arc::clone(checker_tasks);
    scheduler.on_fn(EXPIRE_CHECKER_TASK, move |ctx| {
        let checker_tasks = Arc::clone(&checker_tasks);
        async move {
            match ctx.payload_as::<ExpireCheckerTask>() {
                Ok(payload) => {
                    checker_tasks.remove_task(&payload.task_id);
                    if let Err(e) = ctx.finish().await {
                        error!(error = %e, "Could not finish expiry job");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Malformed expiry job payload");
                    if let Err(e) = ctx.failed().await {
                        error!(error = %e, "Could not fail expiry job");
                    }
                }
            }
        }
    });
}
