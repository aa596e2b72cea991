use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, types::Json, FromRow};
use uuid::Uuid;

use super::{corrupt, db_id};
use crate::error::ProvisioningResult;
use crate::job_queue::{Job, JobId, JobState, JobStore, QueuedJob};

const JOB_COLUMNS: &str = "id, payload, status, attempts, enqueued_at, last_error";

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    payload: Json<Job>,
    status: String,
    attempts: i32,
    enqueued_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_queued(self) -> ProvisioningResult<QueuedJob> {
        let state = JobState::parse(&self.status)
            .ok_or_else(|| corrupt("job status", &self.status))?;
        Ok(QueuedJob {
            id: self.id,
            job: self.payload.0,
            state,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            enqueued_at: self.enqueued_at,
            last_error: self.last_error,
        })
    }
}

/// Job rows shared by every process pointed at the same database. The unique
/// `(kind, order_id)` index enforces deduplication and `SKIP LOCKED` keeps two
/// workers from claiming the same row.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> ProvisioningResult<Option<QueuedJob>> {
        let sql = format!(
            r#"INSERT INTO provisioning_jobs (id, kind, order_id, payload, status, enqueued_at, ready_at)
               VALUES ($1, $2, $3, $4, 'pending', NOW(), NOW())
               ON CONFLICT (kind, order_id) DO NOTHING
               RETURNING {JOB_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(job.kind().as_str())
            .bind(db_id(job.order_id())?)
            .bind(Json(job))
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_queued).transpose()
    }

    async fn claim_next(&self) -> ProvisioningResult<Option<QueuedJob>> {
        let sql = format!(
            r#"UPDATE provisioning_jobs
               SET status = 'in_flight', attempts = attempts + 1
               WHERE id = (
                   SELECT id FROM provisioning_jobs
                   WHERE status = 'pending' AND ready_at <= NOW()
                   ORDER BY enqueued_at, id
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING {JOB_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_queued).transpose()
    }

    async fn remove(&self, id: JobId) -> ProvisioningResult<bool> {
        let result = sqlx::query("DELETE FROM provisioning_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reschedule(&self, id: JobId, delay: Duration, error: &str) -> ProvisioningResult<()> {
        sqlx::query(
            r#"UPDATE provisioning_jobs
               SET status = 'pending',
                   ready_at = NOW() + make_interval(secs => $2),
                   last_error = $3
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> ProvisioningResult<Vec<QueuedJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM provisioning_jobs ORDER BY enqueued_at, id");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_queued).collect()
    }

    async fn release_in_flight(&self) -> ProvisioningResult<u64> {
        let result = sqlx::query(
            "UPDATE provisioning_jobs SET status = 'pending' WHERE status = 'in_flight'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
