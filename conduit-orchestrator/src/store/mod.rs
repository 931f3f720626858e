//! Execution store
//!
//! Durable record of every execution, its stage history and its terminal
//! result. The orchestrator only relies on this contract; `memory` backs
//! tests and single-process runs, `postgres` backs deployments.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgExecutionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::execution::{Execution, ExecutionState, Failure};
use conduit_core::domain::stage::Stage;
use conduit_core::dto::execution::{ExecutionFilter, Page, Pagination};
use conduit_core::dto::provider::HealthResult;
use conduit_core::dto::statistics::TimeRange;
use uuid::Uuid;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// State fields written together by `update_state`
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub state: ExecutionState,
    pub provider: Option<String>,
    pub provider_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<Failure>,
    pub dispatch_attempts: u32,
}

impl From<&Execution> for StateUpdate {
    fn from(execution: &Execution) -> Self {
        Self {
            state: execution.state,
            provider: execution.provider.clone(),
            provider_ref: execution.provider_ref.clone(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            failure: execution.failure.clone(),
            dispatch_attempts: execution.dispatch_attempts,
        }
    }
}

impl StateUpdate {
    fn apply_to(&self, execution: &mut Execution) {
        execution.state = self.state;
        execution.provider = self.provider.clone();
        execution.provider_ref = self.provider_ref.clone();
        execution.started_at = self.started_at;
        execution.completed_at = self.completed_at;
        execution.failure = self.failure.clone();
        execution.dispatch_attempts = self.dispatch_attempts;
    }
}

/// Grouping for `aggregate_counts`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Nothing,
    Provider,
    Template,
}

/// One `(group, state)` bucket of `aggregate_counts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRow {
    pub key: Option<String>,
    pub state: ExecutionState,
    pub count: u64,
    /// Executions in this bucket with both start and end timestamps
    pub timed: u64,
    /// Sum of their durations
    pub total_duration_ms: i64,
}

/// Persistence contract the orchestrator depends on
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persists a new execution record
    async fn create_execution(&self, execution: &Execution) -> StoreResult<Uuid>;

    /// Overwrites the state fields of one execution atomically
    async fn update_state(&self, id: Uuid, update: &StateUpdate) -> StoreResult<()>;

    /// Appends a stage snapshot to the execution's stage log
    ///
    /// The visible stage list is the latest snapshot per stage name, in order
    /// of first appearance.
    async fn append_stage(&self, id: Uuid, stage: &Stage) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>>;

    /// Lists executions matching `filter`, newest first
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> StoreResult<Page<Execution>>;

    /// Counts executions created within `range` per group and state
    async fn aggregate_counts(&self, range: TimeRange, group_by: GroupBy)
    -> StoreResult<Vec<CountRow>>;

    /// Write-only audit trail of health probes
    async fn record_health(&self, result: &HealthResult) -> StoreResult<()>;
}

fn matches_filter(execution: &Execution, filter: &ExecutionFilter) -> bool {
    (filter.states.is_empty() || filter.states.contains(&execution.state))
        && filter
            .provider
            .as_ref()
            .is_none_or(|provider| execution.provider.as_ref() == Some(provider))
        && filter
            .template_id
            .as_ref()
            .is_none_or(|template| execution.template_id.as_ref() == Some(template))
        && filter
            .repository
            .as_ref()
            .is_none_or(|repository| &execution.repository == repository)
        && filter
            .environment
            .as_ref()
            .is_none_or(|environment| &execution.environment == environment)
}
