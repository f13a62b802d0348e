//! Postgres-backed outbox store implementation.
//!
//! Persists event records in a single `outbox_events` table and enforces the
//! relay's transition discipline at the database level: every status change
//! is a single-row conditional `UPDATE ... WHERE status = 'NEW'`, so the
//! store stays correct under concurrent dispatch workers without any
//! application-level read-modify-write.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `OutboxStoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError | Scenario |
//! |------------|----------------------|------------------|----------|
//! | Database (unique violation) | `23505` | `AlreadyExists` | Writer re-inserted an existing event id |
//! | Database (other) | Any other | `Storage` | Constraint or database failure |
//! | ColumnDecode / Decode | N/A | `Serialization` | Row did not decode into a record |
//! | Other | N/A | `Storage` | Network errors, pool closed, etc. |
//!
//! ## Thread Safety
//!
//! `PostgresOutboxStore` is `Send + Sync` and can be shared across tasks.
//! All operations go through the SQLx connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use relaykit_core::EventId;
use relaykit_outbox::{
    EventRecord, EventStatus, FailureVerdict, OutboxStats, OutboxStore, OutboxStoreError,
};

const SELECT_COLUMNS: &str = "id, event_type, aggregate_id, payload::text AS payload, status, \
     attempt_count, last_error, created_at, sent_at, last_attempt_at, next_attempt_at";

/// Postgres-backed outbox store.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    /// Create a new store backed by the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `outbox_events` table and its dispatch index (idempotent).
    ///
    /// The partial index covers exactly the `fetch_pending` scan:
    /// `status = 'NEW'` range-ordered by `created_at`.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id              UUID PRIMARY KEY,
                event_type      TEXT NOT NULL,
                aggregate_id    TEXT NOT NULL,
                payload         JSONB NOT NULL,
                status          TEXT NOT NULL DEFAULT 'NEW',
                attempt_count   INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                created_at      TIMESTAMPTZ NOT NULL,
                sent_at         TIMESTAMPTZ,
                last_attempt_at TIMESTAMPTZ,
                next_attempt_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(map_storage_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
                ON outbox_events (created_at)
                WHERE status = 'NEW'
            "#,
        )
        .execute(self.pool.as_ref())
        .await
        .map_err(map_storage_err)?;

        Ok(())
    }

    /// Insert a record inside a caller-owned transaction.
    ///
    /// This is the event writer's entry point: the insert commits or aborts
    /// together with the business mutation, which is the entire point of the
    /// outbox pattern.
    #[instrument(skip(self, tx, record), fields(event_id = %record.id), err)]
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &EventRecord,
    ) -> Result<(), OutboxStoreError> {
        insert_record(&mut **tx, record).await
    }
}

/// Shared INSERT used by both the pooled and the transaction-scoped append.
async fn insert_record<'e, E>(executor: E, record: &EventRecord) -> Result<(), OutboxStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO outbox_events
            (id, event_type, aggregate_id, payload, status, attempt_count,
             last_error, created_at, sent_at, last_attempt_at, next_attempt_at)
        VALUES ($1, $2, $3, $4::jsonb, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(&record.event_type)
    .bind(&record.aggregate_id)
    .bind(&record.payload)
    .bind(record.status.as_str())
    .bind(record.attempt_count as i32)
    .bind(&record.last_error)
    .bind(record.created_at)
    .bind(record.sent_at)
    .bind(record.last_attempt_at)
    .bind(record.next_attempt_at)
    .execute(executor)
    .await
    .map_err(|e| map_insert_err(e, record.id))?;

    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, record), fields(event_id = %record.id), err)]
    async fn append(&self, record: EventRecord) -> Result<EventId, OutboxStoreError> {
        insert_record(self.pool.as_ref(), &record).await?;
        Ok(record.id)
    }

    #[instrument(skip(self), err)]
    async fn fetch_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, OutboxStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM outbox_events
            WHERE status = 'NEW'
              AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(map_storage_err)?;

        rows.into_iter().map(|row| row_to_record(&row)).collect()
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_sent(&self, id: EventId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'SENT', sent_at = $2, last_error = NULL, next_attempt_at = NULL
            WHERE id = $1 AND status = 'NEW'
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(self.pool.as_ref())
        .await
        .map_err(map_storage_err)?;

        if result.rows_affected() == 0 {
            // Already terminal (idempotent no-op) or genuinely unknown.
            self.require_exists(id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, verdict), fields(event_id = %id), err)]
    async fn mark_failed(
        &self,
        id: EventId,
        verdict: &FailureVerdict,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = match verdict {
            FailureVerdict::Retry {
                error,
                next_attempt_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET attempt_count = attempt_count + 1,
                        last_error = $2,
                        last_attempt_at = $3,
                        next_attempt_at = $4
                    WHERE id = $1 AND status = 'NEW'
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(now)
                .bind(next_attempt_at)
                .execute(self.pool.as_ref())
                .await
            }
            FailureVerdict::Exhausted { error } => {
                sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET status = 'FAILED',
                        attempt_count = attempt_count + 1,
                        last_error = $2,
                        last_attempt_at = $3,
                        next_attempt_at = NULL
                    WHERE id = $1 AND status = 'NEW'
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(now)
                .execute(self.pool.as_ref())
                .await
            }
            FailureVerdict::Rejected {
                error,
                attempt_floor,
            } => {
                sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET status = 'FAILED',
                        attempt_count = GREATEST(attempt_count + 1, $4),
                        last_error = $2,
                        last_attempt_at = $3,
                        next_attempt_at = NULL
                    WHERE id = $1 AND status = 'NEW'
                    "#,
                )
                .bind(id.as_uuid())
                .bind(error)
                .bind(now)
                .bind(*attempt_floor as i32)
                .execute(self.pool.as_ref())
                .await
            }
        }
        .map_err(map_storage_err)?;

        if result.rows_affected() == 0 {
            self.require_exists(id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<EventRecord>, OutboxStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(map_storage_err)?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'NEW')    AS pending,
                COUNT(*) FILTER (WHERE status = 'SENT')   AS sent,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed,
                MIN(created_at) FILTER (WHERE status = 'NEW') AS oldest_pending
            FROM outbox_events
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(map_storage_err)?;

        Ok(OutboxStats {
            pending: row.try_get::<i64, _>("pending").map_err(map_decode_err)?.max(0) as u64,
            sent: row.try_get::<i64, _>("sent").map_err(map_decode_err)?.max(0) as u64,
            failed: row.try_get::<i64, _>("failed").map_err(map_decode_err)?.max(0) as u64,
            oldest_pending_created_at: row
                .try_get::<Option<DateTime<Utc>>, _>("oldest_pending")
                .map_err(map_decode_err)?,
        })
    }
}

impl PostgresOutboxStore {
    async fn require_exists(&self, id: EventId) -> Result<(), OutboxStoreError> {
        let exists = sqlx::query("SELECT 1 FROM outbox_events WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(map_storage_err)?;

        match exists {
            Some(_) => Ok(()),
            None => Err(OutboxStoreError::NotFound(id)),
        }
    }
}

fn row_to_record(row: &PgRow) -> Result<EventRecord, OutboxStoreError> {
    let status: String = row.try_get("status").map_err(map_decode_err)?;
    let status: EventStatus = status
        .parse()
        .map_err(|e| OutboxStoreError::Serialization(format!("{e}")))?;

    Ok(EventRecord {
        id: EventId::from_uuid(row.try_get::<Uuid, _>("id").map_err(map_decode_err)?),
        event_type: row.try_get("event_type").map_err(map_decode_err)?,
        aggregate_id: row.try_get("aggregate_id").map_err(map_decode_err)?,
        payload: row.try_get("payload").map_err(map_decode_err)?,
        status,
        attempt_count: row
            .try_get::<i32, _>("attempt_count")
            .map_err(map_decode_err)?
            .max(0) as u32,
        last_error: row.try_get("last_error").map_err(map_decode_err)?,
        created_at: row.try_get("created_at").map_err(map_decode_err)?,
        sent_at: row.try_get("sent_at").map_err(map_decode_err)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(map_decode_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(map_decode_err)?,
    })
}

fn map_insert_err(e: sqlx::Error, id: EventId) -> OutboxStoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some("23505") {
            return OutboxStoreError::AlreadyExists(id);
        }
    }
    map_storage_err(e)
}

fn map_storage_err(e: sqlx::Error) -> OutboxStoreError {
    match e {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            OutboxStoreError::Serialization(e.to_string())
        }
        other => OutboxStoreError::Storage(other.to_string()),
    }
}

fn map_decode_err(e: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::Serialization(e.to_string())
}
