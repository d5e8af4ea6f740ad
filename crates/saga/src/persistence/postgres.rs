//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence with:
//! - Optimistic concurrency control via a per-workflow version column
//! - Workflow + step rows created in one transaction
//! - Aggregate counts for monitoring via GROUP BY
//!
//! Tables: `saga_workflows`, `saga_steps`. [`PostgresWorkflowStore::migrate`]
//! applies the embedded DDL.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::workflow::{
    StatusParseError, StepRecord, WorkflowContext, WorkflowRecord,
};

use super::store::*;

/// Embedded schema for the saga tables
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS saga_workflows (
    id UUID PRIMARY KEY,
    workflow_type TEXT NOT NULL,
    status TEXT NOT NULL,
    input_data JSONB NOT NULL,
    output_data JSONB,
    context JSONB NOT NULL DEFAULT '{}'::jsonb,
    error JSONB,
    retry_count INTEGER NOT NULL DEFAULT 0,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    tenant_id TEXT,
    version BIGINT NOT NULL DEFAULT 1,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_saga_workflows_status ON saga_workflows (status);
CREATE INDEX IF NOT EXISTS idx_saga_workflows_type ON saga_workflows (workflow_type);
CREATE INDEX IF NOT EXISTS idx_saga_workflows_tenant ON saga_workflows (tenant_id);

CREATE TABLE IF NOT EXISTS saga_steps (
    id UUID PRIMARY KEY,
    workflow_id UUID NOT NULL REFERENCES saga_workflows (id),
    name TEXT NOT NULL,
    step_order INTEGER NOT NULL,
    target_system TEXT NOT NULL,
    status TEXT NOT NULL,
    output_data JSONB,
    compensation_data JSONB,
    error JSONB,
    retry_count INTEGER NOT NULL DEFAULT 0,
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    UNIQUE (workflow_id, step_order)
);

CREATE INDEX IF NOT EXISTS idx_saga_steps_workflow ON saga_steps (workflow_id);
"#;

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use provisio_saga::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/provisio").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema (idempotent)
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to apply saga schema: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, workflow, steps), fields(workflow_id = %workflow.id))]
    async fn create_workflow(
        &self,
        workflow: &WorkflowRecord,
        steps: &[StepRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO saga_workflows
                (id, workflow_type, status, input_data, output_data, context,
                 error, retry_count, tenant_id, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.workflow_type)
        .bind(workflow.status.as_str())
        .bind(&workflow.input_data)
        .bind(&workflow.output_data)
        .bind(context_json(&workflow.context)?)
        .bind(error_json(&workflow.error)?)
        .bind(workflow.retry_count as i32)
        .bind(&workflow.tenant_id)
        .bind(workflow.version)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to insert workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO saga_steps
                    (id, workflow_id, name, step_order, target_system, status,
                     output_data, compensation_data, error, retry_count,
                     started_at, finished_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(step.id)
            .bind(step.workflow_id)
            .bind(&step.name)
            .bind(step.step_order)
            .bind(&step.target_system)
            .bind(step.status.as_str())
            .bind(&step.output_data)
            .bind(&step.compensation_data)
            .bind(error_json(&step.error)?)
            .bind(step.retry_count as i32)
            .bind(step.started_at)
            .bind(step.finished_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("failed to insert step: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(steps = steps.len(), "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input_data, output_data, context,
                   error, retry_count, tenant_id, version, created_at, updated_at
            FROM saga_workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, name, step_order, target_system, status,
                   output_data, compensation_data, error, retry_count,
                   started_at, finished_at
            FROM saga_steps
            WHERE workflow_id = $1
            ORDER BY step_order ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows.is_empty() {
            // Distinguish "workflow has no steps" from "no such workflow"
            let exists = sqlx::query("SELECT 1 FROM saga_workflows WHERE id = $1")
                .bind(workflow_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if exists.is_none() {
                return Err(StoreError::WorkflowNotFound(workflow_id));
            }
        }

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn update_workflow(
        &self,
        workflow: &WorkflowRecord,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE saga_workflows
            SET status = $2,
                output_data = $3,
                context = $4,
                error = $5,
                retry_count = $6,
                version = version + 1,
                updated_at = now()
            WHERE id = $1 AND version = $7
            RETURNING version
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.status.as_str())
        .bind(&workflow.output_data)
        .bind(context_json(&workflow.context)?)
        .bind(error_json(&workflow.error)?)
        .bind(workflow.retry_count as i32)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to update workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => Ok(row.get::<i64, _>("version")),
            None => {
                // Either the workflow is gone or another writer advanced it
                let actual = sqlx::query("SELECT version FROM saga_workflows WHERE id = $1")
                    .bind(workflow.id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))?
                    .ok_or(StoreError::WorkflowNotFound(workflow.id))?;

                Err(StoreError::Conflict {
                    workflow_id: workflow.id,
                    expected: expected_version,
                    actual: actual.get::<i64, _>("version"),
                })
            }
        }
    }

    #[instrument(skip(self, step), fields(step_id = %step.id))]
    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE saga_steps
            SET status = $2,
                output_data = $3,
                compensation_data = $4,
                error = $5,
                retry_count = $6,
                started_at = $7,
                finished_at = $8
            WHERE id = $1
            "#,
        )
        .bind(step.id)
        .bind(step.status.as_str())
        .bind(&step.output_data)
        .bind(&step.compensation_data)
        .bind(error_json(&step.error)?)
        .bind(step.retry_count as i32)
        .bind(step.started_at)
        .bind(step.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to update step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(step.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE saga_workflows SET cancel_requested = TRUE WHERE id = $1",
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_requested(&self, workflow_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM saga_workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        Ok(row.get("cancel_requested"))
    }

    #[instrument(skip(self))]
    async fn clear_cancel(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE saga_workflows SET cancel_requested = FALSE WHERE id = $1",
        )
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    #[instrument(skip(self, filter, pagination))]
    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        pagination: Pagination,
    ) -> Result<Page<WorkflowRecord>, StoreError> {
        let mut count_query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM saga_workflows WHERE TRUE");
        push_filter(&mut count_query, &filter);

        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .get("total");

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, workflow_type, status, input_data, output_data, context, \
             error, retry_count, tenant_id, version, created_at, updated_at \
             FROM saga_workflows WHERE TRUE",
        );
        push_filter(&mut query, &filter);
        query.push(" ORDER BY created_at DESC LIMIT ");
        query.push_bind(pagination.limit as i64);
        query.push(" OFFSET ");
        query.push_bind(pagination.offset as i64);

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let items = rows
            .iter()
            .map(workflow_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total as u64,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    #[instrument(skip(self))]
    async fn count_workflows(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<WorkflowCounts, StoreError> {
        let mut counts = WorkflowCounts::default();

        let mut by_status: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT status, COUNT(*) AS total FROM saga_workflows WHERE TRUE",
        );
        if let Some(tenant) = tenant_id {
            by_status.push(" AND tenant_id = ");
            by_status.push_bind(tenant);
        }
        by_status.push(" GROUP BY status");

        for row in by_status
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            let status: String = row.get("status");
            let total: i64 = row.get("total");
            counts.by_status.insert(status, total as u64);
        }

        let mut by_type: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT workflow_type, COUNT(*) AS total FROM saga_workflows WHERE TRUE",
        );
        if let Some(tenant) = tenant_id {
            by_type.push(" AND tenant_id = ");
            by_type.push_bind(tenant);
        }
        by_type.push(" GROUP BY workflow_type");

        for row in by_type
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
        {
            let workflow_type: String = row.get("workflow_type");
            let total: i64 = row.get("total");
            counts.by_type.insert(workflow_type, total as u64);
        }

        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn list_resumable(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM saga_workflows
            WHERE status IN ('pending', 'running', 'rolling_back')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }
}

/// Append filter conditions shared by the list and count queries
fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &WorkflowFilter) {
    if let Some(status) = filter.status {
        query.push(" AND status = ");
        query.push_bind(status.as_str());
    }
    if let Some(ref workflow_type) = filter.workflow_type {
        query.push(" AND workflow_type = ");
        query.push_bind(workflow_type.clone());
    }
    if let Some(ref tenant_id) = filter.tenant_id {
        query.push(" AND tenant_id = ");
        query.push_bind(tenant_id.clone());
    }
}

fn context_json(context: &WorkflowContext) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(context).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn error_json<T: serde::Serialize>(error: &Option<T>) -> Result<Option<serde_json::Value>, StoreError> {
    error
        .as_ref()
        .map(|e| serde_json::to_value(e).map_err(|e| StoreError::Serialization(e.to_string())))
        .transpose()
}

fn parse_status<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = StatusParseError>,
{
    value
        .parse()
        .map_err(|e: StatusParseError| StoreError::Serialization(e.to_string()))
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowRecord, StoreError> {
    let status: String = row.get("status");
    let context: serde_json::Value = row.get("context");
    let error: Option<serde_json::Value> = row.get("error");
    let retry_count: i32 = row.get("retry_count");

    Ok(WorkflowRecord {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        status: parse_status(&status)?,
        input_data: row.get("input_data"),
        output_data: row.get("output_data"),
        context: serde_json::from_value(context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        retry_count: retry_count as u32,
        tenant_id: row.get("tenant_id"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord, StoreError> {
    let status: String = row.get("status");
    let error: Option<serde_json::Value> = row.get("error");
    let retry_count: i32 = row.get("retry_count");

    Ok(StepRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        name: row.get("name"),
        step_order: row.get("step_order"),
        target_system: row.get("target_system"),
        status: parse_status(&status)?,
        output_data: row.get("output_data"),
        compensation_data: row.get("compensation_data"),
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        retry_count: retry_count as u32,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}
