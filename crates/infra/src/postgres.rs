//! Postgres-backed job record store.
//!
//! One row per job in `generation_jobs`; the full `JobRecord` lives in a
//! JSONB column, with `status`, `heartbeat_at` and timestamps mirrored into
//! plain columns for operators and stall sweeps.
//!
//! ## Atomic updates
//!
//! `update()` runs in a transaction:
//! 1. `SELECT ... FOR UPDATE` locks the row
//! 2. the `JobPatch` is applied in Rust (the same merge the in-memory store uses)
//! 3. the record is written back and the transaction commits
//!
//! Two invocations racing on one job serialize on the row lock, so StagePart
//! merges never lose a committed chunk.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database, code `23505` on insert | `AlreadyExists` |
//! | Database (other) / PoolClosed / other | `Storage` |
//! | JSONB decode failure | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, debug, instrument};

use draftmill_core::JobId;
use draftmill_pipeline::{JobPatch, JobRecord, JobStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generation_jobs (
    id            UUID PRIMARY KEY,
    status        TEXT NOT NULL,
    record        JSONB NOT NULL,
    heartbeat_at  TIMESTAMPTZ,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS generation_jobs_created_at_idx
    ON generation_jobs (created_at DESC);
CREATE INDEX IF NOT EXISTS generation_jobs_status_idx
    ON generation_jobs (status);
"#;

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

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.id), err)]
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let body = encode(&record)?;
        sqlx::query(
            r#"
            INSERT INTO generation_jobs (id, status, record, heartbeat_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(&body)
        .bind(record.heartbeat_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM generation_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    #[instrument(skip(self, patch), fields(job_id = %job_id, status = tracing::field::Empty), err)]
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query("SELECT record FROM generation_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_record", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(job_id));
        };

        let mut record = decode_row(&row)?;
        patch.apply_to(&mut record, Utc::now());
        let body = encode(&record)?;

        sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = $2, record = $3, heartbeat_at = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(record.status.as_str())
        .bind(&body)
        .bind(record.heartbeat_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("write_record", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("status", record.status.as_str());
        debug!(status = %record.status, progress = record.progress, "record updated");
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn touch_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        // Only the heartbeat moves; the JSON copy is kept in step with the column.
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET heartbeat_at = $2,
                record = jsonb_set(record, '{heartbeat_at}', to_jsonb($3::text))
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(at)
        .bind(at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch_heartbeat", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT record FROM generation_jobs ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_row).collect()
    }
}

fn encode(record: &JobRecord) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(record)
        .map_err(|e| StoreError::Serialization(format!("failed to encode job record: {e}")))
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
    let value: serde_json::Value = row
        .try_get("record")
        .map_err(|e| StoreError::Serialization(format!("failed to read record column: {e}")))?;
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(format!("failed to decode job record: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| c.as_ref() == "23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use draftmill_pipeline::{GenerationBrief, JobStatus, StagePart};

    #[test]
    fn pool_errors_become_storage_errors() {
        let err = map_sqlx_error("list", sqlx::Error::PoolClosed);
        assert_eq!(err, StoreError::Storage("connection pool closed in list".into()));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn record_survives_the_jsonb_encoding() {
        let mut record = JobRecord::new(GenerationBrief::new(
            "A cartographer maps a city that rearranges itself nightly",
            "fantasy",
            "curious",
        ));
        let mut part = StagePart::chunked("beats", "abc", 5);
        part.complete_chunk(1, []);
        JobPatch::new()
            .status(JobStatus::Generating)
            .upsert_part(part)
            .apply_to(&mut record, Utc::now());

        let body = encode(&record).unwrap();
        let back: JobRecord = serde_json::from_value(body).unwrap();
        assert_eq!(back, record);
    }

    /// Runs against a live database when `DRAFTMILL_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn live_round_trip_and_racing_updates() {
        let Ok(url) = std::env::var("DRAFTMILL_TEST_DATABASE_URL") else {
            return;
        };
        let store = PostgresJobStore::connect(&url).await.unwrap();
        store.ensure_schema().await.unwrap();

        let record = JobRecord::new(GenerationBrief::new(
            "A cartographer maps a city that rearranges itself nightly",
            "fantasy",
            "curious",
        ));
        let job_id = record.id;
        store.insert(record.clone()).await.unwrap();
        assert_eq!(
            store.insert(record).await.unwrap_err(),
            StoreError::AlreadyExists(job_id)
        );

        // Two writers that each only know about their own chunk.
        let writes = (1..=2).map(|index| {
            let store = store.clone();
            async move {
                let mut part = StagePart::chunked("beats", "h", 5);
                part.complete_chunk(index, []);
                store.update(job_id, JobPatch::new().upsert_part(part)).await
            }
        });
        for result in futures_join(writes).await {
            result.unwrap();
        }

        let now = Utc::now();
        store.touch_heartbeat(job_id, now).await.unwrap();

        let stored = store.get(job_id).await.unwrap().unwrap();
        let chunks = stored.parts["beats"].chunks.as_ref().unwrap();
        assert_eq!(chunks.chunks_done.len(), 2);
        assert!(stored.heartbeat_at.is_some());
        assert!(store.list(10).await.unwrap().iter().any(|r| r.id == job_id));
    }

    async fn futures_join<F, T>(futures: impl Iterator<Item = F>) -> Vec<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = futures.map(tokio::spawn).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }
}
