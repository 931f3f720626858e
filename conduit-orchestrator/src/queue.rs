//! Dispatch queue
//!
//! In-memory, priority-ordered queue of executions waiting for a provider.
//! Ordering key is `(priority ascending, created_at ascending)`, with ties
//! broken by arrival order. Items the scheduler cannot serve right now are
//! skipped in place, so they keep their position relative to later arrivals.

use chrono::{DateTime, Utc};
use conduit_core::domain::execution::Execution;
use conduit_core::domain::provider::PipelineType;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

/// What the scheduler needs to know about a queued execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedExecution {
    pub execution_id: Uuid,
    pub priority: i32,
    pub pipeline_type: PipelineType,
    pub provider_preference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Execution> for QueuedExecution {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.id,
            priority: execution.priority,
            pipeline_type: execution.pipeline_type().clone(),
            provider_preference: execution.provider_preference.clone(),
            created_at: execution.created_at,
        }
    }
}

/// Multi-producer, single-consumer dispatch queue
///
/// Removal happens under the same lock as the predicate check, so an item
/// handed out by `dequeue_next` can never be handed out again.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    buckets: Mutex<BTreeMap<i32, VecDeque<QueuedExecution>>>,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, VecDeque<QueuedExecution>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an execution and wakes the scheduler
    pub fn enqueue(&self, item: QueuedExecution) {
        {
            let mut buckets = self.lock();
            let bucket = buckets.entry(item.priority).or_default();

            // Fresh submissions always land at the back; only recovered
            // records can carry an older timestamp than the current tail.
            match bucket.back() {
                Some(last) if last.created_at > item.created_at => {
                    let at = bucket.partition_point(|queued| queued.created_at <= item.created_at);
                    bucket.insert(at, item);
                }
                _ => bucket.push_back(item),
            }
        }

        self.notify.notify_one();
    }

    /// Removes and returns the first execution, in queue order, that satisfies `accept`
    ///
    /// Items rejected by the predicate stay where they are.
    pub fn dequeue_next<F>(&self, mut accept: F) -> Option<QueuedExecution>
    where
        F: FnMut(&QueuedExecution) -> bool,
    {
        let mut buckets = self.lock();

        let (priority, index) = buckets.iter().find_map(|(priority, bucket)| {
            bucket
                .iter()
                .position(&mut accept)
                .map(|index| (*priority, index))
        })?;

        let bucket = buckets.get_mut(&priority)?;
        let item = bucket.remove(index);

        if bucket.is_empty() {
            buckets.remove(&priority);
        }

        item
    }

    /// Removes a specific execution, e.g. on cancellation
    pub fn remove(&self, execution_id: Uuid) -> Option<QueuedExecution> {
        let mut buckets = self.lock();

        let (priority, index) = buckets.iter().find_map(|(priority, bucket)| {
            bucket
                .iter()
                .position(|queued| queued.execution_id == execution_id)
                .map(|index| (*priority, index))
        })?;

        let bucket = buckets.get_mut(&priority)?;
        let item = bucket.remove(index);

        if bucket.is_empty() {
            buckets.remove(&priority);
        }

        item
    }

    pub fn contains(&self, execution_id: Uuid) -> bool {
        self.lock()
            .values()
            .any(|bucket| bucket.iter().any(|queued| queued.execution_id == execution_id))
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the queue contents in dispatch order
    pub fn snapshot(&self) -> Vec<QueuedExecution> {
        self.lock().values().flatten().cloned().collect()
    }

    /// Completes when something was enqueued since the last wait
    pub async fn wait_for_enqueue(&self) {
        self.notify.notified().await;
    }
}
