//! Postgres-backed job store.
//!
//! ## Schema
//!
//! One row per admission attempt in `jobs`. `admitted_at` holds epoch
//! seconds; `id` is the insertion order used to break timestamp ties.
//!
//! ## Atomicity
//!
//! - `admit` runs in a transaction holding `pg_advisory_xact_lock` keyed by
//!   the object id, so concurrent admissions of one object serialize while
//!   different objects proceed in parallel
//! - appending a new attempt first cancels any unfinished attempt for the
//!   same object inside that transaction
//! - `complete` is a single conditional `UPDATE ... WHERE status NOT IN
//!   (terminal)`; the first terminal write wins
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | anything else | any | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use hasty_core::{JobId, ObjectId};
use hasty_jobs::{AdmissionDecision, Job, JobOutcome, JobStatus, ReadmissionMode};

use super::store::{
    AdmissionRules, AdmitOutcome, CompleteOutcome, JobStore, JobStoreError, StoredJob,
    check_update,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              BIGSERIAL PRIMARY KEY,
    job_id          UUID        NOT NULL UNIQUE,
    object_id       TEXT        NOT NULL,
    status          TEXT        NOT NULL,
    admitted_at     BIGINT      NOT NULL,
    sleep_time_used INTEGER     NULL
);
CREATE INDEX IF NOT EXISTS jobs_object_latest_idx
    ON jobs (object_id, admitted_at DESC, id DESC);
"#;

const SELECT_COLUMNS: &str = "id, job_id, object_id, status, admitted_at, sleep_time_used";

/// Postgres-backed job store.
///
/// `Send + Sync`; share one instance behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `url` and make sure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert_row(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<StoredJob, JobStoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO jobs (job_id, object_id, status, admitted_at, sleep_time_used) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {SELECT_COLUMNS}"
        ))
        .bind(job.job_id.as_uuid())
        .bind(job.object_id.as_str())
        .bind(job.status.as_str())
        .bind(job.timestamp.timestamp())
        .bind(job.sleep_time_used.map(|s| s as i32))
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.job_id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        stored_from_row(&row)
    }

    async fn supersede_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        object_id: &ObjectId,
    ) -> Result<u64, JobStoreError> {
        let done = sqlx::query(
            "UPDATE jobs SET status = 'cancelled' \
             WHERE object_id = $1 AND status NOT IN ('finished', 'cancelled')",
        )
        .bind(object_id.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("supersede", e))?;
        Ok(done.rows_affected())
    }

    async fn latest_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        object_id: &ObjectId,
    ) -> Result<Option<StoredJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE object_id = $1 \
             ORDER BY admitted_at DESC, id DESC LIMIT 1"
        ))
        .bind(object_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("find_latest", e))?;
        row.as_ref().map(stored_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(object_id = %object_id), err)]
    async fn find_latest_by_object_id(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE object_id = $1 \
             ORDER BY admitted_at DESC, id DESC LIMIT 1"
        ))
        .bind(object_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_latest", e))?;
        Ok(row.as_ref().map(stored_from_row).transpose()?.map(|s| s.job))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn find_by_job_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_job_id", e))?;
        Ok(row.as_ref().map(stored_from_row).transpose()?.map(|s| s.job))
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, object_id = %job.object_id), err)]
    async fn insert(&self, job: Job) -> Result<StoredJob, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let stored = Self::insert_row(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(job_id = %job_id, status = %status), err)]
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        sleep_time_used: Option<u32>,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE job_id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status_lock", e))?
        .ok_or(JobStoreError::NotFound(job_id))?;
        check_update(&stored_from_row(&current)?.job, status)?;

        let row = sqlx::query(&format!(
            "UPDATE jobs SET status = $2, sleep_time_used = COALESCE($3, sleep_time_used) \
             WHERE job_id = $1 RETURNING {SELECT_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(sleep_time_used.map(|s| s as i32))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored_from_row(&row)?.job)
    }

    #[instrument(skip(self, rules), fields(object_id = %object_id, outcome), err)]
    async fn admit(
        &self,
        object_id: ObjectId,
        rules: AdmissionRules,
        now: DateTime<Utc>,
    ) -> Result<AdmitOutcome, JobStoreError> {
        let span = Span::current();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(object_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        let latest = Self::latest_in_tx(&mut tx, &object_id).await?;
        let decision = rules
            .cooldown
            .evaluate(latest.as_ref().map(|s| &s.job), now);

        let outcome = match (decision, latest) {
            (AdmissionDecision::Reject { retry_after_secs }, Some(latest)) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                span.record("outcome", "rejected");
                return Ok(AdmitOutcome::Rejected {
                    latest: latest.job,
                    retry_after_secs,
                });
            }
            (AdmissionDecision::Reject { .. }, None) => {
                return Err(JobStoreError::Storage(
                    "rejection without a latest job".to_string(),
                ));
            }
            (AdmissionDecision::Readmit, Some(prev))
                if rules.readmission == ReadmissionMode::Rearm =>
            {
                let mut job = prev.job.clone();
                job.rearm(now);
                let row = sqlx::query(&format!(
                    "UPDATE jobs SET job_id = $2, status = $3, admitted_at = $4, \
                     sleep_time_used = NULL WHERE id = $1 RETURNING {SELECT_COLUMNS}"
                ))
                .bind(prev.id)
                .bind(job.job_id.as_uuid())
                .bind(job.status.as_str())
                .bind(job.timestamp.timestamp())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("rearm", e))?;
                span.record("outcome", "rearmed");
                stored_from_row(&row)?.job
            }
            _ => {
                let superseded = Self::supersede_in_tx(&mut tx, &object_id).await?;
                if superseded > 0 {
                    debug!(superseded, "cancelled unfinished attempts");
                }
                let job = Job::admit(object_id.clone(), now);
                span.record("outcome", "inserted");
                Self::insert_row(&mut tx, &job).await?.job
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(AdmitOutcome::Admitted(outcome))
    }

    #[instrument(skip(self), fields(job_id = %job_id, outcome = ?outcome), err)]
    async fn complete(
        &self,
        job_id: JobId,
        outcome: JobOutcome,
        sleep_time_used: u32,
    ) -> Result<CompleteOutcome, JobStoreError> {
        let applied = sqlx::query(&format!(
            "UPDATE jobs SET status = $2, sleep_time_used = $3 \
             WHERE job_id = $1 AND status NOT IN ('finished', 'cancelled') \
             RETURNING {SELECT_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(outcome.status().as_str())
        .bind(sleep_time_used as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if let Some(row) = applied {
            return Ok(CompleteOutcome::Applied(stored_from_row(&row)?.job));
        }

        match self.find_by_job_id(job_id).await? {
            Some(job) => Ok(CompleteOutcome::AlreadyTerminal(job)),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }
}

fn stored_from_row(row: &PgRow) -> Result<StoredJob, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let id: i64 = row.try_get("id").map_err(decode)?;
    let job_id: Uuid = row.try_get("job_id").map_err(decode)?;
    let object_id: String = row.try_get("object_id").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let admitted_at: i64 = row.try_get("admitted_at").map_err(decode)?;
    let sleep_time_used: Option<i32> = row.try_get("sleep_time_used").map_err(decode)?;

    let invalid = |what: &str, detail: String| {
        JobStoreError::Storage(format!("invalid {what} in job row {id}: {detail}"))
    };

    Ok(StoredJob {
        id,
        job: Job {
            job_id: JobId::from_uuid(job_id),
            object_id: ObjectId::parse(object_id).map_err(|e| invalid("object_id", e.to_string()))?,
            status: status
                .parse()
                .map_err(|e: hasty_core::DomainError| invalid("status", e.to_string()))?,
            timestamp: DateTime::from_timestamp(admitted_at, 0)
                .ok_or_else(|| invalid("admitted_at", admitted_at.to_string()))?,
            sleep_time_used: sleep_time_used
                .map(u32::try_from)
                .transpose()
                .map_err(|e| invalid("sleep_time_used", e.to_string()))?,
        },
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{operation} failed: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
