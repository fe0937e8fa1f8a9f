use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Payload, SagaId, StepId};
use outbox::{NewOutboxMessage, OutboxMessage, PostgresOutboxStore};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::compensation::CompensationLog;
use crate::record::{Saga, SagaStatus, SagaStep, StepStatus};
use crate::store::SagaStore;
use crate::{Result, SagaError};

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

const SAGA_COLUMNS: &str =
    "id, saga_type, status, payload, started_at, updated_at, completed_at, last_error";

const STEP_COLUMNS: &str =
    "id, saga_id, step_name, status, payload, created_at, completed_at, compensation_step_id";

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Appends a step record within an existing transaction.
    ///
    /// Lets the compensation log commit the record together with its
    /// outbox row.
    pub async fn insert_step_in(
        tx: &mut Transaction<'_, Postgres>,
        step: &SagaStep,
    ) -> Result<()> {
        Self::insert_step_with(&mut **tx, step).await
    }

    async fn insert_step_with<'e, E: sqlx::PgExecutor<'e>>(
        executor: E,
        step: &SagaStep,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_steps
                (id, saga_id, step_name, status, payload, created_at, completed_at, compensation_step_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(step.saga_id.as_uuid())
        .bind(&step.step_name)
        .bind(step.status.as_str())
        .bind(step.payload.as_ref().map(Payload::to_json))
        .bind(step.created_at)
        .bind(step.completed_at)
        .bind(step.compensation_step_id.map(|id| id.as_uuid()))
        .execute(executor)
        .await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<Saga> {
        let status_text: String = row.try_get("status")?;
        let status = SagaStatus::parse(&status_text).ok_or_else(|| {
            SagaError::Serialization(serde_json::Error::io(std::io::Error::other(format!(
                "unknown saga status: {status_text}"
            ))))
        })?;

        Ok(Saga {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            status,
            payload: Payload::from_json(row.try_get("payload")?),
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
        })
    }

    fn row_to_step(row: PgRow) -> Result<SagaStep> {
        let status_text: String = row.try_get("status")?;
        let status = StepStatus::parse(&status_text).ok_or_else(|| {
            SagaError::Serialization(serde_json::Error::io(std::io::Error::other(format!(
                "unknown step status: {status_text}"
            ))))
        })?;

        Ok(SagaStep {
            id: StepId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            step_name: row.try_get("step_name")?,
            status,
            payload: row
                .try_get::<Option<serde_json::Value>, _>("payload")?
                .map(Payload::from_json),
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
            compensation_step_id: row
                .try_get::<Option<Uuid>, _>("compensation_step_id")?
                .map(StepId::from_uuid),
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn insert_saga(&self, saga: &Saga) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sagas
                (id, saga_type, status, payload, started_at, updated_at, completed_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(&saga.saga_type)
        .bind(saga.status.as_str())
        .bind(saga.payload.to_json())
        .bind(saga.started_at)
        .bind(saga.updated_at)
        .bind(saga.completed_at)
        .bind(&saga.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_saga(&self, saga: &Saga) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $2, updated_at = $3, completed_at = $4, last_error = $5
            WHERE id = $1
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.status.as_str())
        .bind(saga.updated_at)
        .bind(saga.completed_at)
        .bind(&saga.last_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaError::SagaNotFound(saga.id));
        }
        Ok(())
    }

    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<Saga>> {
        let row = sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1"))
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn insert_step(&self, step: &SagaStep) -> Result<()> {
        Self::insert_step_with(&self.pool, step).await
    }

    async fn update_step(&self, step: &SagaStep) -> Result<()> {
        // Step records only move forward from Started; same-status writes
        // are allowed so a settled stamp can be refreshed idempotently.
        let result = sqlx::query(
            "UPDATE saga_steps SET status = $2, completed_at = $3 \
             WHERE id = $1 AND (status = 'Started' OR status = $2)",
        )
        .bind(step.id.as_uuid())
        .bind(step.status.as_str())
        .bind(step.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_step(step.id).await? {
                Some(existing) => Err(SagaError::InvalidStepTransition {
                    step_id: step.id,
                    from: existing.status,
                    to: step.status,
                }),
                None => Err(SagaError::StepNotFound(step.id)),
            };
        }
        Ok(())
    }

    async fn get_step(&self, step_id: StepId) -> Result<Option<SagaStep>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps WHERE id = $1"
        ))
        .bind(step_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_step).transpose()
    }

    async fn steps_for_saga(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps \
             WHERE saga_id = $1 ORDER BY created_at ASC"
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step).collect()
    }

    async fn completed_steps_desc(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps \
             WHERE saga_id = $1 AND status = 'Completed' AND compensation_step_id IS NULL \
             ORDER BY created_at DESC"
        ))
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step).collect()
    }

    async fn find_compensation_record(
        &self,
        compensation_step_id: StepId,
    ) -> Result<Option<SagaStep>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps WHERE compensation_step_id = $1"
        ))
        .bind(compensation_step_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_step).transpose()
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Saga>> {
        let rows = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas \
             WHERE status NOT IN ('Completed', 'Compensated', 'PartiallyCompleted') \
             AND updated_at < $1 \
             ORDER BY updated_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }
}

/// Compensation log committing the step record and its outbox row in one
/// database transaction.
#[derive(Clone)]
pub struct PostgresCompensationLog {
    pool: PgPool,
}

impl PostgresCompensationLog {
    /// Creates a log over the given pool. The saga tables and the outbox
    /// table must live in the same database.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompensationLog for PostgresCompensationLog {
    async fn append(&self, record: &SagaStep, message: NewOutboxMessage) -> Result<OutboxMessage> {
        let mut tx = self.pool.begin().await?;
        let row = PostgresOutboxStore::enqueue_in(&mut tx, message).await?;
        PostgresSagaStore::insert_step_in(&mut tx, record).await?;
        tx.commit().await?;
        Ok(row)
    }
}
