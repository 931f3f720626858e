//! Execution tracker
//!
//! Owns the working set of non-terminal executions and is the only place
//! where execution state changes. Provider status reaches it through
//! `report_stage_update`, either pushed by a provider callback or produced
//! by the tracker's own polling loop.
//!
//! Every change is applied in memory first and then persisted. A record the
//! store failed to accept stays in the working set, marked dirty, and is
//! written again on the next tracker cycle. Terminal records are evicted
//! once their final state is stored.

use chrono::{DateTime, Utc};
use conduit_core::domain::execution::{
    Execution, ExecutionEvent, ExecutionState, Failure, FailureCategory,
};
use conduit_core::domain::stage::{Stage, StageState};
use conduit_core::dto::provider::{ProviderStatus, RemoteState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, ProviderError, Result};
use crate::provider::ProviderRegistry;
use crate::store::{ExecutionStore, StateUpdate, StoreResult};

struct Tracked {
    execution: Execution,
    last_progress: Instant,
    /// Bumped on every in-memory change
    version: u64,
    /// Version last accepted by the store
    persisted_version: u64,
    /// Stage snapshots not yet appended to the store
    pending_stages: Vec<Stage>,
    cancel_requested: bool,
}

impl Tracked {
    fn new(execution: Execution) -> Self {
        Self {
            execution,
            last_progress: Instant::now(),
            version: 0,
            persisted_version: 0,
            pending_stages: Vec::new(),
            cancel_requested: false,
        }
    }

    fn is_dirty(&self) -> bool {
        self.version != self.persisted_version || !self.pending_stages.is_empty()
    }
}

/// An in-flight execution due for a status check
struct PollTarget {
    id: Uuid,
    provider: String,
    reference: String,
    stalled: bool,
}

/// Authoritative state machine for every execution in the working set
pub struct ExecutionTracker {
    working: Mutex<HashMap<Uuid, Tracked>>,
    /// Serialises store writes so a newer snapshot is never overwritten by an older one
    persist: tokio::sync::Mutex<()>,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ProviderRegistry>,
    call_timeout: Duration,
    poll_interval: Duration,
    stall_threshold: Duration,
}

impl ExecutionTracker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ProviderRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            working: Mutex::new(HashMap::new()),
            persist: tokio::sync::Mutex::new(()),
            store,
            registry,
            call_timeout: config.provider_call_timeout,
            poll_interval: config.poll_interval,
            stall_threshold: config.stall_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Tracked>> {
        self.working.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Working set
    // =========================================================================

    /// Starts tracking an execution that is already stored
    pub fn track(&self, execution: Execution) {
        debug!(
            "Tracking execution {} ({})",
            execution.id, execution.state
        );
        self.lock().insert(execution.id, Tracked::new(execution));
    }

    /// Re-attaches an execution loaded from the store after a restart
    pub fn restore(&self, execution: Execution) {
        if execution.state.is_in_flight() {
            if let Some(provider) = &execution.provider {
                self.registry.restore_in_flight(provider);
            }
        }
        self.track(execution);
    }

    /// Current in-memory view of a tracked execution
    pub fn get(&self, id: Uuid) -> Option<Execution> {
        self.lock().get(&id).map(|tracked| tracked.execution.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of tracked records the store has not caught up with
    pub fn dirty_count(&self) -> usize {
        self.lock().values().filter(|t| t.is_dirty()).count()
    }

    /// Raises the cancellation flag and returns the execution's current state
    ///
    /// The dispatcher checks the flag before each `submit()` attempt and
    /// before committing an accepted job.
    pub fn request_cancel(&self, id: Uuid) -> Option<ExecutionState> {
        let mut working = self.lock();
        let tracked = working.get_mut(&id)?;
        tracked.cancel_requested = true;
        Some(tracked.execution.state)
    }

    pub fn is_cancel_requested(&self, id: Uuid) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|tracked| tracked.cancel_requested)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Applies `event` to a tracked execution, then persists it
    ///
    /// `mutate` runs only if the transition is legal and may fill in the
    /// fields that go with the event (provider, failure, attempt count).
    /// Persistence failures do not undo the transition; the record is kept
    /// dirty and retried.
    pub async fn transition<F>(&self, id: Uuid, event: ExecutionEvent, mutate: F) -> Result<Execution>
    where
        F: FnOnce(&mut Execution) + Send,
    {
        let execution = {
            let mut working = self.lock();
            let tracked = working
                .get_mut(&id)
                .ok_or(OrchestratorError::ExecutionNotFound(id))?;

            self.step(tracked, event, mutate)?;
            tracked.execution.clone()
        };

        self.flush(id).await;
        Ok(execution)
    }

    fn step<F>(&self, tracked: &mut Tracked, event: ExecutionEvent, mutate: F) -> Result<ExecutionState>
    where
        F: FnOnce(&mut Execution),
    {
        let id = tracked.execution.id;
        let from = tracked.execution.state;

        let next = from.transition(event).map_err(|rejected| {
            warn!(
                "Rejected transition for execution {}: {} on {:?}",
                id, rejected.from, rejected.event
            );
            if from.is_terminal() {
                OrchestratorError::AlreadyTerminal { id, state: from }
            } else {
                OrchestratorError::InvalidTransition { id, from, event }
            }
        })?;

        let execution = &mut tracked.execution;
        execution.state = next;
        mutate(execution);

        let now = Utc::now();
        if next == ExecutionState::Running && execution.started_at.is_none() {
            execution.started_at = Some(now);
        }
        if next.is_terminal() && execution.completed_at.is_none() {
            execution.completed_at = Some(now);
        }

        if next.is_terminal() && from.is_in_flight() {
            if let Some(provider) = &execution.provider {
                self.registry.record_finished(provider, next);
            }
        }

        tracked.version += 1;
        tracked.last_progress = Instant::now();

        match &execution.failure {
            Some(failure) if next == ExecutionState::Failed => info!(
                "Execution {} {} -> {} ({}: {})",
                id, from, next, failure.category, failure.reason
            ),
            _ => info!("Execution {} {} -> {}", id, from, next),
        }

        Ok(next)
    }

    // =========================================================================
    // Status reports
    // =========================================================================

    /// Applies a provider's view of an execution
    ///
    /// Stages are merged monotonically; a report can never move a stage or
    /// the execution backwards. Reports for terminal executions are discarded.
    pub async fn report_stage_update(&self, id: Uuid, status: ProviderStatus) -> Result<ExecutionState> {
        let outcome = {
            let mut working = self.lock();
            working
                .get_mut(&id)
                .map(|tracked| self.apply_report(tracked, &status))
        };

        match outcome {
            Some(state) => {
                self.flush(id).await;
                Ok(state)
            }
            None => {
                // Not in the working set: either evicted after finishing or unknown
                match self.store.get_execution(id).await? {
                    Some(execution) => {
                        debug!(
                            "Discarding late report for execution {} (already {})",
                            id, execution.state
                        );
                        Ok(execution.state)
                    }
                    None => Err(OrchestratorError::ExecutionNotFound(id)),
                }
            }
        }
    }

    /// Applies a report-driven transition whose source state was checked by the caller
    fn reconcile<F>(&self, tracked: &mut Tracked, event: ExecutionEvent, mutate: F)
    where
        F: FnOnce(&mut Execution),
    {
        let result = self.step(tracked, event, mutate);
        debug_assert!(
            result.is_ok(),
            "report reconciliation attempted {:?} from {}",
            event,
            tracked.execution.state
        );
        if let Err(err) = result {
            error!(
                "Dropped {:?} for execution {} while applying a report: {}",
                event, tracked.execution.id, err
            );
        }
    }

    fn apply_report(&self, tracked: &mut Tracked, status: &ProviderStatus) -> ExecutionState {
        let id = tracked.execution.id;
        let state = tracked.execution.state;

        if state.is_terminal() || state == ExecutionState::Queued {
            debug!(
                "Discarding report for execution {} in state {}",
                id, state
            );
            return state;
        }

        let mut progressed = false;
        for observed in &status.stages {
            let stages = &mut tracked.execution.stages;
            let changed = match stages.iter_mut().find(|s| s.name == observed.name) {
                Some(existing) => existing.merge(observed).then(|| existing.clone()),
                None => {
                    let mut stage = Stage::pending(observed.name.clone());
                    stage.merge(observed);
                    stages.push(stage.clone());
                    Some(stage)
                }
            };

            if let Some(stage) = changed {
                debug!(
                    "Execution {} stage {} is {}",
                    id, stage.name, stage.state
                );
                tracked.pending_stages.push(stage);
                progressed = true;
            }
        }

        if progressed {
            tracked.version += 1;
            tracked.last_progress = Instant::now();
        }

        let stages = &tracked.execution.stages;
        let started = stages.iter().any(|s| s.state != StageState::Pending)
            || matches!(
                status.overall,
                RemoteState::Running | RemoteState::Completed | RemoteState::Failed { .. }
            );
        let finished = status.overall == RemoteState::Completed
            || (!stages.is_empty()
                && stages.iter().all(|s| s.state == StageState::Completed)
                && !matches!(status.overall, RemoteState::Failed { .. }));

        if let RemoteState::Failed { reason } = &status.overall {
            let failure = Failure::new(FailureCategory::ProviderReportedFailure, reason.clone());
            self.reconcile(tracked, ExecutionEvent::ProviderFailed, |execution| {
                execution.failure = Some(failure);
            });
            return tracked.execution.state;
        }

        if started && tracked.execution.state == ExecutionState::Assigned {
            let first_start = earliest_start(&tracked.execution.stages);
            self.reconcile(tracked, ExecutionEvent::Started, |execution| {
                execution.started_at = first_start.or(execution.started_at);
            });
        }

        if finished && tracked.execution.state == ExecutionState::Running {
            let last_end = latest_end(&tracked.execution.stages);
            self.reconcile(tracked, ExecutionEvent::Finished, |execution| {
                execution.completed_at = last_end;
            });
        }

        tracked.execution.state
    }

    // =========================================================================
    // Polling and stall detection
    // =========================================================================

    /// Polls every assigned or running execution once
    ///
    /// Provider calls run concurrently, outside any lock, each bounded by the
    /// call timeout. An execution without progress for longer than the stall
    /// threshold whose provider no longer knows the job is failed with
    /// `provider-timeout`.
    pub async fn poll_once(&self) {
        let targets: Vec<PollTarget> = {
            let working = self.lock();
            working
                .values()
                .filter(|tracked| tracked.execution.state.is_in_flight())
                .filter_map(|tracked| {
                    Some(PollTarget {
                        id: tracked.execution.id,
                        provider: tracked.execution.provider.clone()?,
                        reference: tracked.execution.provider_ref.clone()?,
                        stalled: tracked.last_progress.elapsed() > self.stall_threshold,
                    })
                })
                .collect()
        };

        let mut polls = JoinSet::new();
        for target in targets {
            let adapter = self.registry.adapter(&target.provider);
            let timeout = self.call_timeout;

            polls.spawn(async move {
                let outcome = match adapter {
                    Some(adapter) => {
                        match time::timeout(timeout, adapter.fetch_status(&target.reference)).await
                        {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ProviderError::Timeout(timeout)),
                        }
                    }
                    None => Err(ProviderError::UnknownExecution(target.reference.clone())),
                };
                (target, outcome)
            });
        }

        while let Some(joined) = polls.join_next().await {
            let (target, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("Status poll task panicked: {}", e);
                    continue;
                }
            };

            match outcome {
                Ok(status) if status.overall != RemoteState::Unknown => {
                    if let Err(e) = self.report_stage_update(target.id, status).await {
                        warn!("Failed to apply status of execution {}: {}", target.id, e);
                    }
                }
                Ok(_) | Err(ProviderError::UnknownExecution(_)) => {
                    if target.stalled {
                        self.fail_stalled(&target).await;
                    } else {
                        debug!(
                            "Provider {} does not know execution {} yet",
                            target.provider, target.id
                        );
                    }
                }
                Err(e) => {
                    debug!(
                        "Status poll for execution {} on {} failed: {}",
                        target.id, target.provider, e
                    );
                }
            }
        }
    }

    async fn fail_stalled(&self, target: &PollTarget) {
        let reason = format!(
            "no progress for over {:?} and provider {} no longer knows job {}",
            self.stall_threshold, target.provider, target.reference
        );
        warn!("Execution {} stalled: {}", target.id, reason);

        let failure = Failure::new(FailureCategory::ProviderTimeout, reason);
        if let Err(e) = self
            .transition(target.id, ExecutionEvent::ProviderFailed, |execution| {
                execution.failure = Some(failure);
            })
            .await
        {
            debug!("Stalled execution {} not failed: {}", target.id, e);
        }
    }

    /// Runs the polling loop until `shutdown` flips to `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting execution tracker (poll interval: {:?}, stall threshold: {:?})",
            self.poll_interval, self.stall_threshold
        );

        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                    self.flush_dirty().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let remaining = self.flush_dirty().await;
        if remaining > 0 {
            warn!("Execution tracker stopped with {} unflushed record(s)", remaining);
        } else {
            info!("Execution tracker stopped");
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Retries every record the store has not accepted yet
    ///
    /// Returns the number of records that are still dirty.
    pub async fn flush_dirty(&self) -> usize {
        let dirty: Vec<Uuid> = self
            .lock()
            .iter()
            .filter(|(_, tracked)| tracked.is_dirty())
            .map(|(id, _)| *id)
            .collect();

        let mut remaining = 0;
        for id in dirty {
            if !self.flush(id).await {
                remaining += 1;
            }
        }
        remaining
    }

    /// Writes the latest snapshot of one record; returns `false` if the store refused it
    async fn flush(&self, id: Uuid) -> bool {
        let _serial = self.persist.lock().await;

        let (update, stages, version, state_dirty) = {
            let mut working = self.lock();
            let Some(tracked) = working.get_mut(&id) else {
                return true;
            };
            if !tracked.is_dirty() {
                return true;
            }
            (
                StateUpdate::from(&tracked.execution),
                std::mem::take(&mut tracked.pending_stages),
                tracked.version,
                tracked.version != tracked.persisted_version,
            )
        };

        let result = self.write(id, &update, &stages, state_dirty).await;

        let mut working = self.lock();
        let Some(tracked) = working.get_mut(&id) else {
            return result.is_ok();
        };

        match result {
            Ok(()) => {
                tracked.persisted_version = version;
                if tracked.execution.is_terminal() && !tracked.is_dirty() {
                    working.remove(&id);
                    debug!("Execution {} evicted from the working set", id);
                }
                true
            }
            Err(e) => {
                error!("Failed to persist execution {}: {}", id, e);
                // Appending a snapshot twice is harmless: reads keep the latest per stage
                let mut restored = stages;
                restored.append(&mut tracked.pending_stages);
                tracked.pending_stages = restored;
                false
            }
        }
    }

    async fn write(
        &self,
        id: Uuid,
        update: &StateUpdate,
        stages: &[Stage],
        state_dirty: bool,
    ) -> StoreResult<()> {
        for stage in stages {
            self.store.append_stage(id, stage).await?;
        }
        if state_dirty {
            self.store.update_state(id, update).await?;
        }
        Ok(())
    }
}

fn earliest_start(stages: &[Stage]) -> Option<DateTime<Utc>> {
    stages.iter().filter_map(|s| s.started_at).min()
}

fn latest_end(stages: &[Stage]) -> Option<DateTime<Utc>> {
    stages.iter().filter_map(|s| s.completed_at).max()
}
