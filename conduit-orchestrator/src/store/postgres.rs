//! PostgreSQL execution store
//!
//! Executions live in one row each; stage snapshots are appended to
//! `execution_stages` and projected back to "latest per name" on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::execution::{Execution, ExecutionState, Failure, FailureCategory};
use conduit_core::domain::stage::{Stage, StageState};
use conduit_core::dto::execution::{ExecutionFilter, Page, Pagination};
use conduit_core::dto::provider::HealthResult;
use conduit_core::dto::statistics::TimeRange;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::{CountRow, ExecutionStore, GroupBy, StateUpdate, StoreResult};
use crate::error::StoreError;

const EXECUTION_COLUMNS: &str = r#"
    id, template_id, repository, branch, environment, config, parameters,
    priority, provider_preference, provider, provider_ref, state,
    created_at, queued_at, started_at, completed_at,
    failure_category, failure_reason, dispatch_attempts
"#;

/// Execution store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Latest snapshot of each stage for the given executions, in first-appearance order
    async fn latest_stages(&self, ids: &[Uuid]) -> StoreResult<HashMap<Uuid, Vec<Stage>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT execution_id, name, state, started_at, completed_at, duration_ms
            FROM (
                SELECT DISTINCT ON (execution_id, name)
                       execution_id, name, state, started_at, completed_at, duration_ms,
                       MIN(seq) OVER (PARTITION BY execution_id, name) AS first_seq
                FROM execution_stages
                WHERE execution_id = ANY($1)
                ORDER BY execution_id, name, seq DESC
            ) latest
            ORDER BY execution_id, first_seq
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut stages: HashMap<Uuid, Vec<Stage>> = HashMap::new();
        for row in rows {
            let execution_id = row.execution_id;
            stages
                .entry(execution_id)
                .or_default()
                .push(Stage::try_from(row)?);
        }

        Ok(stages)
    }

    async fn hydrate(&self, rows: Vec<ExecutionRow>) -> StoreResult<Vec<Execution>> {
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut stages = self.latest_stages(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let mut execution = Execution::try_from(row)?;
                execution.stages = stages.remove(&execution.id).unwrap_or_default();
                Ok(execution)
            })
            .collect()
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create_execution(&self, execution: &Execution) -> StoreResult<Uuid> {
        let (failure_category, failure_reason) = failure_columns(execution.failure.as_ref());

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, template_id, repository, branch, environment, pipeline_type,
                config, parameters, priority, provider_preference, provider,
                provider_ref, state, created_at, queued_at, started_at,
                completed_at, failure_category, failure_reason, dispatch_attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.template_id)
        .bind(&execution.repository)
        .bind(&execution.branch)
        .bind(&execution.environment)
        .bind(execution.pipeline_type().as_str())
        .bind(serde_json::to_value(&execution.config)?)
        .bind(serde_json::to_value(&execution.parameters)?)
        .bind(execution.priority)
        .bind(&execution.provider_preference)
        .bind(&execution.provider)
        .bind(&execution.provider_ref)
        .bind(execution.state.as_str())
        .bind(execution.created_at)
        .bind(execution.queued_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(failure_category)
        .bind(failure_reason)
        .bind(attempts_to_db(execution.dispatch_attempts))
        .execute(&self.pool)
        .await?;

        Ok(execution.id)
    }

    async fn update_state(&self, id: Uuid, update: &StateUpdate) -> StoreResult<()> {
        let (failure_category, failure_reason) = failure_columns(update.failure.as_ref());

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state = $1, provider = $2, provider_ref = $3, started_at = $4,
                completed_at = $5, failure_category = $6, failure_reason = $7,
                dispatch_attempts = $8
            WHERE id = $9
            "#,
        )
        .bind(update.state.as_str())
        .bind(&update.provider)
        .bind(&update.provider_ref)
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(failure_category)
        .bind(failure_reason)
        .bind(attempts_to_db(update.dispatch_attempts))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }

    async fn append_stage(&self, id: Uuid, stage: &Stage) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_stages (
                execution_id, name, state, started_at, completed_at, duration_ms, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(&stage.name)
        .bind(stage.state.as_str())
        .bind(stage.started_at)
        .bind(stage.completed_at)
        .bind(stage.duration_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {} FROM executions WHERE id = $1",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> StoreResult<Page<Execution>> {
        const WHERE_CLAUSE: &str = r#"
            WHERE (cardinality($1::text[]) = 0 OR state = ANY($1))
              AND ($2::text IS NULL OR provider = $2)
              AND ($3::text IS NULL OR template_id = $3)
              AND ($4::text IS NULL OR repository = $4)
              AND ($5::text IS NULL OR environment = $5)
        "#;

        let states: Vec<String> = filter
            .states
            .iter()
            .map(|state| state.as_str().to_string())
            .collect();

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM executions {}",
            WHERE_CLAUSE
        ))
        .bind(&states)
        .bind(&filter.provider)
        .bind(&filter.template_id)
        .bind(&filter.repository)
        .bind(&filter.environment)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {} FROM executions {} ORDER BY created_at DESC, id LIMIT $6 OFFSET $7",
            EXECUTION_COLUMNS, WHERE_CLAUSE
        ))
        .bind(&states)
        .bind(&filter.provider)
        .bind(&filter.template_id)
        .bind(&filter.repository)
        .bind(&filter.environment)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            items: self.hydrate(rows).await?,
            total: total.max(0) as usize,
        })
    }

    async fn aggregate_counts(
        &self,
        range: TimeRange,
        group_by: GroupBy,
    ) -> StoreResult<Vec<CountRow>> {
        let key_column = match group_by {
            GroupBy::Nothing => "NULL::text",
            GroupBy::Provider => "provider",
            GroupBy::Template => "template_id",
        };

        let rows = sqlx::query_as::<_, CountRowDb>(&format!(
            r#"
            SELECT {} AS key,
                   state,
                   COUNT(*) AS count,
                   COUNT(*) FILTER (
                       WHERE started_at IS NOT NULL AND completed_at IS NOT NULL
                   ) AS timed,
                   COALESCE(SUM(
                       GREATEST(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000, 0)
                   ) FILTER (
                       WHERE started_at IS NOT NULL AND completed_at IS NOT NULL
                   ), 0)::BIGINT AS total_duration_ms
            FROM executions
            WHERE created_at >= $1 AND created_at < $2
            GROUP BY 1, state
            ORDER BY 1, state
            "#,
            key_column
        ))
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CountRow::try_from).collect()
    }

    async fn record_health(&self, result: &HealthResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_health (
                provider, healthy, details, status, connection, checked_at, response_time_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&result.provider)
        .bind(result.healthy)
        .bind(&result.details)
        .bind(result.status.to_string())
        .bind(result.connection.to_string())
        .bind(result.checked_at)
        .bind(i64::try_from(result.response_time_ms).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn failure_columns(failure: Option<&Failure>) -> (Option<&'static str>, Option<String>) {
    match failure {
        Some(failure) => (Some(failure.category.as_str()), Some(failure.reason.clone())),
        None => (None, None),
    }
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn decode_error(message: String) -> StoreError {
    StoreError::Database(sqlx::Error::Decode(message.into()))
}

fn parse_state(s: &str) -> StoreResult<ExecutionState> {
    ExecutionState::parse(s).ok_or_else(|| decode_error(format!("unknown execution state {}", s)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    template_id: Option<String>,
    repository: String,
    branch: String,
    environment: String,
    config: serde_json::Value,
    parameters: serde_json::Value,
    priority: i32,
    provider_preference: Option<String>,
    provider: Option<String>,
    provider_ref: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failure_category: Option<String>,
    failure_reason: Option<String>,
    dispatch_attempts: i32,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let failure = match row.failure_category {
            Some(category) => {
                let category = FailureCategory::parse(&category).ok_or_else(|| {
                    decode_error(format!("unknown failure category {}", category))
                })?;
                Some(Failure::new(category, row.failure_reason.unwrap_or_default()))
            }
            None => None,
        };

        Ok(Execution {
            id: row.id,
            template_id: row.template_id,
            repository: row.repository,
            branch: row.branch,
            environment: row.environment,
            config: serde_json::from_value(row.config)?,
            parameters: serde_json::from_value(row.parameters)?,
            priority: row.priority,
            provider_preference: row.provider_preference,
            provider: row.provider,
            provider_ref: row.provider_ref,
            state: parse_state(&row.state)?,
            created_at: row.created_at,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            stages: Vec::new(),
            failure,
            dispatch_attempts: u32::try_from(row.dispatch_attempts).unwrap_or(0),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    execution_id: Uuid,
    name: String,
    state: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl TryFrom<StageRow> for Stage {
    type Error = StoreError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        let state = StageState::parse(&row.state)
            .ok_or_else(|| decode_error(format!("unknown stage state {}", row.state)))?;

        Ok(Stage {
            name: row.name,
            state,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CountRowDb {
    key: Option<String>,
    state: String,
    count: i64,
    timed: i64,
    total_duration_ms: i64,
}

impl TryFrom<CountRowDb> for CountRow {
    type Error = StoreError;

    fn try_from(row: CountRowDb) -> Result<Self, Self::Error> {
        Ok(CountRow {
            key: row.key,
            state: parse_state(&row.state)?,
            count: row.count.max(0) as u64,
            timed: row.timed.max(0) as u64,
            total_duration_ms: row.total_duration_ms,
        })
    }
}
