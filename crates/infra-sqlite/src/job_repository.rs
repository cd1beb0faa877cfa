// SQLite JobRepository Implementation

use crate::error::{corrupt, map_sqlx_error};
use async_trait::async_trait;
use bulwark_core::domain::{Job, JobId, JobPayload, JobStatus};
use bulwark_core::port::{JobRepository, StoreError, StoreResult};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert(&self, job: &Job) -> StoreResult<()> {
        let payload = serde_json::to_string(job.payload.as_map())
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, run_at, listener, payload, retry_count, status, grp, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.run_at)
        .bind(&job.listener)
        .bind(payload)
        .bind(job.retry_count)
        .bind(job.status.as_str())
        .bind(&job.group)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if crate::error::is_unique_violation(&e) {
                StoreError::DuplicateKey {
                    collection: "scheduled_jobs".to_string(),
                    id: job.id.clone(),
                }
            } else {
                map_sqlx_error(e)
            }
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn find_due(
        &self,
        now_millis: i64,
        exclude: &[JobId],
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let mut query: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM scheduled_jobs WHERE status = ");
        query.push_bind(JobStatus::Active.as_str());
        query.push(" AND run_at <= ");
        query.push_bind(now_millis);
        if !exclude.is_empty() {
            query.push(" AND id NOT IN (");
            let mut ids = query.separated(", ");
            for id in exclude {
                ids.push_bind(id.as_str());
            }
            ids.push_unseparated(")");
        }
        query.push(" ORDER BY run_at ASC, created_at ASC LIMIT ");
        query.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows: Vec<JobRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn find_failed(&self) -> StoreResult<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM scheduled_jobs WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(JobStatus::Failed.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update_status(&self, id: &JobId, status: JobStatus) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE scheduled_jobs SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_retry(&self, id: &JobId) -> StoreResult<Option<i64>> {
        // Atomic increment without a separate read
        sqlx::query_scalar(
            r#"
            UPDATE scheduled_jobs
            SET retry_count = retry_count + 1
            WHERE id = ?
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_group(&self, group: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE grp = ?")
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    run_at: i64,
    listener: String,
    payload: String,
    retry_count: i64,
    status: String,
    grp: Option<String>,
    created_at: i64,
}

impl JobRow {
    fn into_job(self) -> StoreResult<Job> {
        let status = JobStatus::from_str(&self.status).map_err(|e| corrupt("job", &self.id, e))?;
        let payload = match serde_json::from_str(&self.payload) {
            Ok(Value::Object(map)) => JobPayload::new(map),
            Ok(other) => return Err(corrupt("job", &self.id, format!("payload {}", other))),
            Err(e) => return Err(corrupt("job", &self.id, e)),
        };

        Ok(Job {
            id: self.id,
            run_at: self.run_at,
            listener: self.listener,
            payload,
            retry_count: self.retry_count,
            status,
            group: self.grp,
            created_at: self.created_at,
        })
    }
}
