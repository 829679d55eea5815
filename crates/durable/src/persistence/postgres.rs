//! PostgreSQL implementation of RunStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via a per-run version column
//! - Transactional checkpoints (run update + step record)
//! - Partial indexes for the wake poller and stale-run recovery

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{Event, StepError};

const RUN_COLUMNS: &str = "id, definition_id, event_id, event_type, event_payload, \
    event_occurred_at, state, current_step_index, attempt, wake_at, last_error, version, \
    created_at, updated_at";

/// PostgreSQL implementation of RunStore
///
/// # Example
///
/// ```ignore
/// use storefront_durable::PostgresRunStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/storefront").await?;
/// let store = PostgresRunStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Work out why a conditional update matched no row
    async fn explain_miss(
        &self,
        run_id: Uuid,
        expected_version: i64,
        to: RunState,
    ) -> StoreError {
        match self.get_run(run_id).await {
            Ok(run) if run.version != expected_version => StoreError::ConcurrencyConflict {
                run_id,
                expected: expected_version,
                actual: run.version,
            },
            Ok(run) => StoreError::InvalidTransition {
                run_id,
                from: run.state,
                to,
            },
            Err(e) => e,
        }
    }

    async fn transition(
        &self,
        run_id: Uuid,
        sql: &str,
        now: DateTime<Utc>,
        to: RunState,
    ) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(sql)
            .bind(run_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => row_to_run(&row),
            None => {
                let run = self.get_run(run_id).await?;
                Err(StoreError::InvalidTransition {
                    run_id,
                    from: run.state,
                    to,
                })
            }
        }
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    error!("run store query failed: {}", e);
    StoreError::Database(e.to_string())
}

fn row_to_run(row: &PgRow) -> Result<WorkflowRun, StoreError> {
    let state: String = row.try_get("state").map_err(db_error)?;
    let current_step_index: i32 = row.try_get("current_step_index").map_err(db_error)?;
    let attempt: i32 = row.try_get("attempt").map_err(db_error)?;

    Ok(WorkflowRun {
        id: row.try_get("id").map_err(db_error)?,
        definition_id: row.try_get("definition_id").map_err(db_error)?,
        trigger_event: Event {
            id: row.try_get("event_id").map_err(db_error)?,
            event_type: row.try_get("event_type").map_err(db_error)?,
            payload: row.try_get("event_payload").map_err(db_error)?,
            occurred_at: row.try_get("event_occurred_at").map_err(db_error)?,
        },
        state: state.parse()?,
        current_step_index: current_step_index.max(0) as u32,
        attempt: attempt.max(0) as u32,
        wake_at: row.try_get("wake_at").map_err(db_error)?,
        last_error: row.try_get("last_error").map_err(db_error)?,
        version: row.try_get("version").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn row_to_record(row: &PgRow) -> Result<StepRecord, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(db_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(db_error)?;

    let error = error
        .map(serde_json::from_value::<StepError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(StepRecord {
        run_id: row.try_get("run_id").map_err(db_error)?,
        step_name: row.try_get("step_name").map_err(db_error)?,
        status: status.parse()?,
        result: row.try_get("result").map_err(db_error)?,
        error,
        attempts: attempts.max(0) as u32,
        completed_at: row.try_get("completed_at").map_err(db_error)?,
    })
}

async fn upsert_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &StepRecord,
) -> Result<(), StoreError> {
    let error = record
        .error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO workflow_step_records
            (run_id, step_name, status, result, error, attempts, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (run_id, step_name) DO UPDATE SET
            status = EXCLUDED.status,
            result = EXCLUDED.result,
            error = EXCLUDED.error,
            attempts = EXCLUDED.attempts,
            completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(record.run_id)
    .bind(&record.step_name)
    .bind(record.status.as_str())
    .bind(&record.result)
    .bind(&error)
    .bind(record.attempts as i32)
    .bind(record.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;

    Ok(())
}

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, runs), fields(count = runs.len()))]
    async fn create_runs(&self, runs: &[WorkflowRun]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for run in runs {
            sqlx::query(
                r#"
                INSERT INTO workflow_runs
                    (id, definition_id, event_id, event_type, event_payload, event_occurred_at,
                     state, current_step_index, attempt, wake_at, last_error, version,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(run.id)
            .bind(&run.definition_id)
            .bind(run.trigger_event.id)
            .bind(&run.trigger_event.event_type)
            .bind(&run.trigger_event.payload)
            .bind(run.trigger_event.occurred_at)
            .bind(run.state.as_str())
            .bind(run.current_step_index as i32)
            .bind(run.attempt as i32)
            .bind(run.wake_at)
            .bind(&run.last_error)
            .bind(run.version)
            .bind(run.created_at)
            .bind(run.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        debug!(count = runs.len(), "created runs");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::RunNotFound(run_id))?;

        row_to_run(&row)
    }

    #[instrument(skip(self))]
    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE ($1::TEXT IS NULL OR state = $1)
              AND ($2::TEXT IS NULL OR definition_id = $2)
            ORDER BY created_at, id
            OFFSET $3 LIMIT $4
            "#
        ))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.definition_id.as_deref())
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_run).collect()
    }

    #[instrument(skip(self))]
    async fn step_records(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_name, status, result, error, attempts, completed_at
            FROM workflow_step_records
            WHERE run_id = $1
            ORDER BY completed_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self))]
    async fn claim_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_runs
            SET state = 'running', wake_at = NULL, updated_at = $3, version = version + 1
            WHERE id = $1 AND version = $2 AND state IN ('pending', 'sleeping', 'running')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(expected_version)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => row_to_run(&row),
            None => Err(self
                .explain_miss(run_id, expected_version, RunState::Running)
                .await),
        }
    }

    #[instrument(skip(self))]
    async fn heartbeat_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET updated_at = $3
            WHERE id = $1 AND version = $2 AND state = 'running'
            "#,
        )
        .bind(run_id)
        .bind(expected_version)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a missing run from one that moved on
        self.get_run(run_id).await.map(|_| false)
    }

    #[instrument(skip(self, update, record), fields(state = %update.state))]
    async fn checkpoint(
        &self,
        run_id: Uuid,
        expected_version: i64,
        update: RunUpdate,
        record: Option<StepRecord>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_runs
            SET state = $3, current_step_index = $4, attempt = $5, wake_at = $6,
                last_error = $7, updated_at = $8, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(expected_version)
        .bind(update.state.as_str())
        .bind(update.current_step_index as i32)
        .bind(update.attempt as i32)
        .bind(update.wake_at)
        .bind(&update.last_error)
        .bind(update.updated_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_error)?;
            return Err(self
                .explain_miss(run_id, expected_version, update.state)
                .await);
        };
        let run = row_to_run(&row)?;

        if let Some(record) = &record {
            upsert_record(&mut tx, record).await?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(run)
    }

    #[instrument(skip(self))]
    async fn cancel_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError> {
        self.transition(
            run_id,
            &format!(
                r#"
                UPDATE workflow_runs
                SET state = 'cancelled', wake_at = NULL, updated_at = $2, version = version + 1
                WHERE id = $1 AND state IN ('pending', 'running', 'sleeping')
                RETURNING {RUN_COLUMNS}
                "#
            ),
            now,
            RunState::Cancelled,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn reset_failed_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError> {
        self.transition(
            run_id,
            &format!(
                r#"
                UPDATE workflow_runs
                SET state = 'pending', attempt = 0, wake_at = NULL, updated_at = $2,
                    version = version + 1
                WHERE id = $1 AND state = 'failed'
                RETURNING {RUN_COLUMNS}
                "#
            ),
            now,
            RunState::Pending,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE state = 'pending'
               OR (state = 'sleeping' AND (wake_at IS NULL OR wake_at <= $1))
            ORDER BY created_at, id
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_run).collect()
    }

    #[instrument(skip(self))]
    async fn stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE state = 'running' AND updated_at < $1
            ORDER BY updated_at, id
            LIMIT $2
            "#
        ))
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_run).collect()
    }
}
