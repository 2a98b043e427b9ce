//! PostgreSQL implementation of the Reflow context store
//!
//! Production persistence for execution contexts:
//! - One row per execution in `workflow_executions`
//! - One row per `(execution_id, source_id, event_type)` in
//!   `workflow_execution_events`; appends use `ON CONFLICT DO NOTHING`
//!   against the composite primary key, which is the dedup primitive that
//!   makes `save` idempotent
//! - Concurrent saves to the same execution serialize on the execution row
//!   lock taken by the upsert inside the transaction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use reflow_core::{
    ContextStore, EventValue, ExecutionContext, ExecutionEvent, ExecutionEventKind, StoreError,
};

/// PostgreSQL-backed [`ContextStore`]
///
/// # Example
///
/// ```ignore
/// use reflow_storage::PostgresContextStore;
///
/// let store = PostgresContextStore::connect("postgres://localhost/reflow").await?;
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresContextStore {
    pool: PgPool,
}

impl PostgresContextStore {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Apply the schema migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn kind_name(kind: ExecutionEventKind) -> Result<String, StoreError> {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| StoreError::Serialization("unrepresentable event kind".to_string()))
}

fn parse_kind(raw: &str) -> Result<ExecutionEventKind, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::Serialization(format!("unknown event type '{raw}': {e}")))
}

#[async_trait]
impl ContextStore for PostgresContextStore {
    #[instrument(skip(self, ctx), fields(execution_id = %ctx.execution_id))]
    async fn save(&self, ctx: &ExecutionContext) -> Result<(), StoreError> {
        let output = ctx
            .output()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // The upsert locks the execution row for the rest of the
        // transaction, serializing concurrent saves of one execution
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (execution_id, name, input, output)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (execution_id)
            DO UPDATE SET input = EXCLUDED.input,
                          output = EXCLUDED.output,
                          updated_at = now()
            "#,
        )
        .bind(&ctx.execution_id)
        .bind(&ctx.name)
        .bind(&ctx.input)
        .bind(&output)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to upsert execution: {e}");
            StoreError::Database(e.to_string())
        })?;

        let mut appended = 0u64;
        for event in &ctx.events {
            let event_type = kind_name(event.kind)?;
            let value = serde_json::to_value(&event.value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let result = sqlx::query(
                r#"
                INSERT INTO workflow_execution_events
                    (execution_id, source_id, event_type, name, value, event_time)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (execution_id, source_id, event_type) DO NOTHING
                "#,
            )
            .bind(&ctx.execution_id)
            .bind(&event.source_id)
            .bind(&event_type)
            .bind(&event.name)
            .bind(&value)
            .bind(event.time)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            appended += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(appended, total = ctx.events.len(), "saved context");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, execution_id: &str) -> Result<ExecutionContext, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id, name, input
            FROM workflow_executions
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to load execution: {e}");
            StoreError::Database(e.to_string())
        })?
        .ok_or_else(|| StoreError::ContextNotFound(execution_id.to_string()))?;

        let mut ctx = ExecutionContext::with_execution_id(
            row.get::<String, _>("execution_id"),
            row.get::<String, _>("name"),
            row.get("input"),
        );

        let rows = sqlx::query(
            r#"
            SELECT source_id, event_type, name, value, event_time
            FROM workflow_execution_events
            WHERE execution_id = $1
            ORDER BY seq
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        for row in rows {
            let kind = parse_kind(&row.get::<String, _>("event_type"))?;
            let value: EventValue = serde_json::from_value(row.get("value"))
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let mut event = ExecutionEvent::new(
                kind,
                row.get::<String, _>("source_id"),
                row.get::<String, _>("name"),
                value,
            );
            event.time = row.get::<DateTime<Utc>, _>("event_time");
            ctx.append(event);
        }

        Ok(ctx)
    }
}
