//! Orchestrator
//!
//! The caller-facing operation surface. An `Orchestrator` is built
//! explicitly from its collaborators (store, provider registry, template
//! catalog) and owns the queue, tracker, scheduler and health monitor.
//! Tests build fresh instances with fake providers and the in-memory store.

use chrono::Utc;
use conduit_core::domain::execution::{Execution, ExecutionEvent, ExecutionState};
use conduit_core::dto::execution::{
    ExecuteResponse, ExecutePipeline, ExecutionFilter, Page, Pagination, PipelineSource, StopAck,
};
use conduit_core::dto::provider::{CancelAck, HealthResult, ProviderStatus, ProviderSummary};
use conduit_core::dto::statistics::{Statistics, TimeRange};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, MAX_PRIORITY};
use crate::error::{OrchestratorError, ProviderError, Result};
use crate::provider::{HealthMonitor, HttpProvider, ProviderRegistry, ProviderSettings};
use crate::queue::{DispatchQueue, QueuedExecution};
use crate::scheduler::Scheduler;
use crate::statistics;
use crate::store::ExecutionStore;
use crate::template::TemplateCatalog;
use crate::tracker::ExecutionTracker;

/// What `recover` reloaded from the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    pub queued: usize,
    pub in_flight: usize,
}

/// Dependency-injected pipeline orchestrator
pub struct Orchestrator {
    config: Config,
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ProviderRegistry>,
    catalog: Arc<TemplateCatalog>,
    queue: Arc<DispatchQueue>,
    tracker: Arc<ExecutionTracker>,
    scheduler: Arc<Scheduler>,
    health: Arc<HealthMonitor>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Creates an orchestrator from explicit collaborators
    ///
    /// Background loops are not running until `start` is called.
    pub fn new(
        config: Config,
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ProviderRegistry>,
        catalog: Arc<TemplateCatalog>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let queue = Arc::new(DispatchQueue::new());
        let tracker = Arc::new(ExecutionTracker::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            &config,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&wake),
            &config,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.health_interval,
            config.health_timeout,
            Arc::clone(&wake),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            registry,
            catalog,
            queue,
            tracker,
            scheduler,
            health,
            wake,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Builds the registry and template catalog from configuration
    ///
    /// Every configured provider is reached through the generic HTTP adapter.
    pub fn from_config(config: Config, store: Arc<dyn ExecutionStore>) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::new(config.health_failure_threshold));

        for provider in &config.providers {
            let adapter = HttpProvider::from_config(provider, config.provider_call_timeout)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            registry.register(
                Arc::new(adapter),
                ProviderSettings {
                    enabled: provider.enabled,
                    max_concurrent: provider.max_concurrent,
                },
            )?;
        }

        let catalog = Arc::new(TemplateCatalog::from_templates(
            config.templates.iter().cloned(),
        )?);

        Ok(Self::new(config, store, registry, catalog))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<TemplateCatalog> {
        &self.catalog
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Reloads unfinished executions from the store
    ///
    /// Queued executions go back into the dispatch queue in priority and
    /// creation order; assigned and running ones are tracked again and
    /// their providers' in-flight counts restored.
    pub async fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        for execution in self.load_all(&[ExecutionState::Queued]).await? {
            if self.tracker.get(execution.id).is_some() {
                continue;
            }
            self.queue.enqueue(QueuedExecution::from(&execution));
            self.tracker.restore(execution);
            recovery.queued += 1;
        }

        for execution in self
            .load_all(&[ExecutionState::Assigned, ExecutionState::Running])
            .await?
        {
            if self.tracker.get(execution.id).is_some() {
                continue;
            }
            self.tracker.restore(execution);
            recovery.in_flight += 1;
        }

        info!(
            "Recovered {} queued and {} in-flight execution(s)",
            recovery.queued, recovery.in_flight
        );
        Ok(recovery)
    }

    async fn load_all(&self, states: &[ExecutionState]) -> Result<Vec<Execution>> {
        let filter = ExecutionFilter::with_states(states.to_vec());
        let mut pagination = Pagination::all();
        let mut executions = Vec::new();

        loop {
            let page = self.store.list_executions(&filter, pagination).await?;
            let fetched = page.items.len();
            executions.extend(page.items);

            if fetched < pagination.limit || executions.len() >= page.total {
                break;
            }
            pagination.offset += fetched;
        }

        Ok(executions)
    }

    /// Spawns the scheduler, health monitor and tracker loops
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            warn!("Orchestrator already started");
            return;
        }

        info!("Starting orchestrator {}", self.config.instance_id);

        tasks.push(tokio::spawn(
            Arc::clone(&self.health).run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.tracker).run(self.shutdown.subscribe()),
        ));
    }

    /// Stops the background loops and waits for them to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!("Orchestrator {} stopped", self.config.instance_id);
    }

    // =========================================================================
    // Executions
    // =========================================================================

    /// Validates, records and enqueues a pipeline execution
    ///
    /// Nothing is created when the request or its template parameters are
    /// invalid. A request no registered provider can run is still accepted;
    /// the response carries a warning and the execution waits in the queue.
    pub async fn execute_pipeline(&self, request: ExecutePipeline) -> Result<ExecuteResponse> {
        for (field, value) in [
            ("repository", &request.repository),
            ("branch", &request.branch),
            ("environment", &request.environment),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestratorError::Validation(format!(
                    "{} cannot be empty",
                    field
                )));
            }
        }

        let priority = request.priority.unwrap_or(self.config.default_priority);
        if !(0..=MAX_PRIORITY).contains(&priority) {
            return Err(OrchestratorError::Validation(format!(
                "priority must be between 0 and {}, got {}",
                MAX_PRIORITY, priority
            )));
        }

        let (config, template_id) = match request.pipeline {
            PipelineSource::Config(config) => (config, None),
            PipelineSource::Template(template_id) => {
                let config = self.catalog.resolve(&template_id, &request.parameters)?;
                (config, Some(template_id))
            }
        };

        let mut warnings = Vec::new();
        if !self.registry.declares(&config.pipeline_type) {
            warn!(
                "No registered provider can run pipeline type {}",
                config.pipeline_type
            );
            warnings.push(format!(
                "no registered provider can run pipeline type {}; the execution stays queued",
                config.pipeline_type
            ));
        }
        if let Some(preferred) = &request.provider_preference {
            if self.registry.summary(preferred).is_none() {
                warnings.push(format!("preferred provider {} is not registered", preferred));
            }
        }

        let now = Utc::now();
        let execution = Execution {
            id: Uuid::new_v4(),
            template_id,
            repository: request.repository,
            branch: request.branch,
            environment: request.environment,
            config,
            parameters: request.parameters,
            priority,
            provider_preference: request.provider_preference,
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
        };

        if let Err(e) = self.store.create_execution(&execution).await {
            error!("Failed to record execution {}: {}", execution.id, e);
            return Err(OrchestratorError::Internal(format!(
                "failed to record execution: {}",
                e
            )));
        }

        info!(
            "Execution {} created: {}@{} -> {} ({}, priority {})",
            execution.id,
            execution.repository,
            execution.branch,
            execution.environment,
            execution.pipeline_type(),
            execution.priority
        );

        let response = ExecuteResponse {
            execution_id: execution.id,
            state: execution.state,
            warnings,
        };

        let queued = QueuedExecution::from(&execution);
        self.tracker.track(execution);
        self.queue.enqueue(queued);

        Ok(response)
    }

    /// Current record of an execution, preferring the in-memory view
    pub async fn get_execution_status(&self, id: Uuid) -> Result<Execution> {
        if let Some(execution) = self.tracker.get(id) {
            return Ok(execution);
        }

        self.store
            .get_execution(id)
            .await?
            .ok_or(OrchestratorError::ExecutionNotFound(id))
    }

    /// Lists stored executions, newest first
    ///
    /// Records the tracker holds a newer view of are replaced by that view.
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        pagination: Pagination,
    ) -> Result<Page<Execution>> {
        let pagination = Pagination {
            offset: pagination.offset,
            limit: pagination.limit.clamp(1, Pagination::MAX_LIMIT),
        };

        let mut page = self.store.list_executions(filter, pagination).await?;
        for item in &mut page.items {
            if let Some(current) = self.tracker.get(item.id) {
                *item = current;
            }
        }

        Ok(page)
    }

    /// Stops an execution
    ///
    /// A queued execution is taken out of the queue and cancelled. One that
    /// is being dispatched gets its cancellation flag raised. An assigned or
    /// running one is cancelled right away and the provider is then asked to
    /// stop it; its answer is returned in the acknowledgement.
    pub async fn stop_execution(&self, id: Uuid) -> Result<StopAck> {
        if self.queue.remove(id).is_some() {
            let execution = self
                .tracker
                .transition(id, ExecutionEvent::CancelRequested, |_| {})
                .await?;
            info!("Execution {} cancelled while queued", id);
            return Ok(StopAck {
                execution_id: id,
                state: execution.state,
                provider_ack: None,
            });
        }

        match self.tracker.request_cancel(id) {
            Some(ExecutionState::Queued) => {
                info!("Execution {} is being dispatched; cancellation requested", id);
                Ok(StopAck {
                    execution_id: id,
                    state: ExecutionState::Queued,
                    provider_ack: None,
                })
            }
            Some(state) if state.is_in_flight() => {
                let execution = self
                    .tracker
                    .transition(id, ExecutionEvent::CancelRequested, |_| {})
                    .await?;
                let provider_ack = self.cancel_at_provider(&execution).await;

                Ok(StopAck {
                    execution_id: id,
                    state: execution.state,
                    provider_ack,
                })
            }
            Some(state) => Err(OrchestratorError::AlreadyTerminal { id, state }),
            None => match self.store.get_execution(id).await? {
                Some(execution) if execution.is_terminal() => {
                    Err(OrchestratorError::AlreadyTerminal {
                        id,
                        state: execution.state,
                    })
                }
                Some(execution) => {
                    error!(
                        "Execution {} is {} in the store but not tracked",
                        id, execution.state
                    );
                    Err(OrchestratorError::Internal(format!(
                        "execution {} is not tracked; run recovery first",
                        id
                    )))
                }
                None => Err(OrchestratorError::ExecutionNotFound(id)),
            },
        }
    }

    async fn cancel_at_provider(&self, execution: &Execution) -> Option<CancelAck> {
        let (Some(provider), Some(reference)) = (&execution.provider, &execution.provider_ref)
        else {
            return None;
        };
        let adapter = self.registry.adapter(provider)?;
        let timeout = self.config.provider_call_timeout;

        let outcome = match time::timeout(timeout, adapter.cancel(reference)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };

        match outcome {
            Ok(ack) => {
                info!(
                    "Provider {} answered cancel of {}: {:?}",
                    provider, execution.id, ack
                );
                Some(ack)
            }
            Err(e) => {
                warn!(
                    "Provider {} did not cancel {}: {}",
                    provider, execution.id, e
                );
                None
            }
        }
    }

    /// Push input for provider status; polling feeds the same path
    pub async fn report_stage_update(
        &self,
        id: Uuid,
        status: ProviderStatus,
    ) -> Result<ExecutionState> {
        self.tracker.report_stage_update(id, status).await
    }

    /// Executions waiting for a provider, in dispatch order
    pub fn queued(&self) -> Vec<QueuedExecution> {
        self.queue.snapshot()
    }

    /// Runs one scheduling pass immediately and returns the dispatch tasks it started
    pub fn dispatch_cycle(&self) -> Vec<JoinHandle<()>> {
        self.scheduler.run_cycle()
    }

    /// Polls every in-flight execution once and retries pending store writes
    pub async fn poll_executions(&self) -> usize {
        self.tracker.poll_once().await;
        self.tracker.flush_dirty().await
    }

    // =========================================================================
    // Providers
    // =========================================================================

    pub fn get_providers(&self) -> Vec<ProviderSummary> {
        self.registry.summaries()
    }

    /// Probes every enabled provider now
    pub async fn check_providers_health(&self) -> Vec<HealthResult> {
        self.health.check_all().await
    }

    pub fn enable_provider(&self, name: &str) -> Result<ProviderSummary> {
        let summary = self.registry.set_enabled(name, true)?;
        self.wake.notify_one();
        Ok(summary)
    }

    pub fn disable_provider(&self, name: &str) -> Result<ProviderSummary> {
        self.registry.set_enabled(name, false)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub async fn get_statistics(&self, range: TimeRange) -> Result<Statistics> {
        statistics::collect(self.store.as_ref(), range).await
    }
}
