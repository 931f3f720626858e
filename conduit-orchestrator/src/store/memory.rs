//! In-memory execution store
//!
//! Used by tests and by single-process runs without a database. It can be
//! switched offline to exercise the orchestrator's behaviour when the store
//! is unavailable.

use async_trait::async_trait;
use conduit_core::domain::execution::Execution;
use conduit_core::domain::stage::Stage;
use conduit_core::dto::execution::{ExecutionFilter, Page, Pagination};
use conduit_core::dto::provider::HealthResult;
use conduit_core::dto::statistics::TimeRange;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CountRow, ExecutionStore, GroupBy, StateUpdate, StoreResult, matches_filter,
};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, Execution>,
    stage_log: HashMap<Uuid, Vec<Stage>>,
    health_log: Vec<HealthResult>,
}

/// Execution store kept in process memory
pub struct MemoryStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: every call fails with `Unavailable` while offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    /// Number of stage snapshots appended for an execution
    pub async fn stage_log_len(&self, id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .stage_log
            .get(&id)
            .map_or(0, Vec::len)
    }

    /// Number of recorded health probes
    pub async fn health_log_len(&self) -> usize {
        self.inner.read().await.health_log.len()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, execution: &Execution) -> StoreResult<Uuid> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.executions.insert(execution.id, execution.clone());
        Ok(execution.id)
    }

    async fn update_state(&self, id: Uuid, update: &StateUpdate) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        update.apply_to(execution);
        Ok(())
    }

    async fn append_stage(&self, id: Uuid, stage: &Stage) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;

        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;

        match execution.stages.iter_mut().find(|s| s.name == stage.name) {
            Some(existing) => *existing = stage.clone(),
            None => execution.stages.push(stage.clone()),
        }

        inner.stage_log.entry(id).or_default().push(stage.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        self.check_available()?;
        Ok(self.inner.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> StoreResult<Page<Execution>> {
        self.check_available()?;
        let inner = self.inner.read().await;

        let mut matching: Vec<&Execution> = inner
            .executions
            .values()
            .filter(|execution| matches_filter(execution, filter))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .cloned()
            .collect();

        Ok(Page { items, total })
    }

    async fn aggregate_counts(
        &self,
        range: TimeRange,
        group_by: GroupBy,
    ) -> StoreResult<Vec<CountRow>> {
        self.check_available()?;
        let inner = self.inner.read().await;

        let mut buckets: BTreeMap<(Option<String>, &'static str), CountRow> = BTreeMap::new();

        for execution in inner
            .executions
            .values()
            .filter(|execution| range.contains(execution.created_at))
        {
            let key = match group_by {
                GroupBy::Nothing => None,
                GroupBy::Provider => execution.provider.clone(),
                GroupBy::Template => execution.template_id.clone(),
            };

            let row = buckets
                .entry((key.clone(), execution.state.as_str()))
                .or_insert_with(|| CountRow {
                    key,
                    state: execution.state,
                    count: 0,
                    timed: 0,
                    total_duration_ms: 0,
                });

            row.count += 1;
            if let Some(duration) = execution.duration_ms() {
                row.timed += 1;
                row.total_duration_ms += duration;
            }
        }

        Ok(buckets.into_values().collect())
    }

    async fn record_health(&self, result: &HealthResult) -> StoreResult<()> {
        self.check_available()?;
        self.inner.write().await.health_log.push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use conduit_core::domain::execution::ExecutionState;
    use conduit_core::domain::provider::PipelineType;
    use conduit_core::domain::stage::StageState;
    use conduit_core::domain::template::PipelineConfig;
    use std::collections::HashMap;

    fn execution(repository: &str) -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::new_v4(),
            template_id: None,
            repository: repository.to_string(),
            branch: "main".to_string(),
            environment: "staging".to_string(),
            config: PipelineConfig::new(PipelineType::FullCicd),
            parameters: HashMap::new(),
            priority: 50,
            provider_preference: None,
            provider: None,
            provider_ref: None,
            state: ExecutionState::Queued,
            created_at: now,
            queued_at: now,
            started_at: None,
            completed_at: None,
            stages: Vec::new(),
            failure: None,
            dispatch_attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_create_and_update_state() {
        let store = MemoryStore::new();
        let mut exec = execution("org/api");
        store.create_execution(&exec).await.unwrap();

        exec.state = ExecutionState::Assigned;
        exec.provider = Some("jenkins".to_string());
        exec.dispatch_attempts = 2;
        store
            .update_state(exec.id, &StateUpdate::from(&exec))
            .await
            .unwrap();

        let stored = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExecutionState::Assigned);
        assert_eq!(stored.provider.as_deref(), Some("jenkins"));
        assert_eq!(stored.dispatch_attempts, 2);
    }

    #[tokio::test]
    async fn test_update_unknown_execution() {
        let store = MemoryStore::new();
        let exec = execution("org/api");
        let result = store.update_state(exec.id, &StateUpdate::from(&exec)).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stage_log_projects_latest_per_name() {
        let store = MemoryStore::new();
        let exec = execution("org/api");
        store.create_execution(&exec).await.unwrap();

        let mut build = Stage::pending("build");
        store.append_stage(exec.id, &build).await.unwrap();
        store
            .append_stage(exec.id, &Stage::pending("deploy"))
            .await
            .unwrap();
        build.state = StageState::Completed;
        store.append_stage(exec.id, &build).await.unwrap();

        let stored = store.get_execution(exec.id).await.unwrap().unwrap();
        let names: Vec<_> = stored.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "deploy"]);
        assert_eq!(stored.stages[0].state, StageState::Completed);
        assert_eq!(store.stage_log_len(exec.id).await, 3);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut exec = execution("org/api");
            exec.created_at = Utc::now() - Duration::seconds(i);
            store.create_execution(&exec).await.unwrap();
        }
        store.create_execution(&execution("org/web")).await.unwrap();

        let filter = ExecutionFilter {
            repository: Some("org/api".to_string()),
            ..ExecutionFilter::default()
        };
        let page = store
            .list_executions(&filter, Pagination { offset: 1, limit: 2 })
            .await
            .unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].created_at >= page.items[1].created_at);
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryStore::new();
        store.set_available(false);
        let result = store.create_execution(&execution("org/api")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_available(true);
        assert!(store.create_execution(&execution("org/api")).await.is_ok());
    }

    #[tokio::test]
    async fn test_aggregate_counts_by_provider() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for (provider, state) in [
            ("jenkins", ExecutionState::Completed),
            ("jenkins", ExecutionState::Failed),
            ("gitlab", ExecutionState::Completed),
        ] {
            let mut exec = execution("org/api");
            exec.provider = Some(provider.to_string());
            exec.state = state;
            exec.started_at = Some(now - Duration::seconds(10));
            exec.completed_at = Some(now);
            store.create_execution(&exec).await.unwrap();
        }

        let rows = store
            .aggregate_counts(TimeRange::last(Duration::hours(1)), GroupBy::Provider)
            .await
            .unwrap();

        let jenkins: u64 = rows
            .iter()
            .filter(|row| row.key.as_deref() == Some("jenkins"))
            .map(|row| row.count)
            .sum();
        assert_eq!(jenkins, 2);
        assert!(rows.iter().all(|row| row.total_duration_ms == 10_000 * row.timed as i64));
    }
}
