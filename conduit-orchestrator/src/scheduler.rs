//! Scheduler / dispatcher loop
//!
//! Pulls executions from the dispatch queue, picks a healthy capable
//! provider for each and hands the job over. Every `submit()` runs in its
//! own task with a per-call timeout, so a slow provider never holds up
//! dispatch to the others.

use conduit_core::domain::execution::{Execution, ExecutionEvent, Failure, FailureCategory};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ProviderError;
use crate::provider::{Candidate, ProviderAdapter, ProviderRegistry, SubmitRequest};
use crate::queue::{DispatchQueue, QueuedExecution};
use crate::tracker::ExecutionTracker;

/// Bounded exponential backoff for `submit()` retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.dispatch_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

enum Outcome {
    Accepted { reference: String, attempts: u32 },
    Exhausted { error: ProviderError, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// The single dispatch loop of an orchestrator process
pub struct Scheduler {
    queue: Arc<DispatchQueue>,
    registry: Arc<ProviderRegistry>,
    tracker: Arc<ExecutionTracker>,
    wake: Arc<Notify>,
    retry: RetryPolicy,
    call_timeout: Duration,
    idle_interval: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<DispatchQueue>,
        registry: Arc<ProviderRegistry>,
        tracker: Arc<ExecutionTracker>,
        wake: Arc<Notify>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            registry,
            tracker,
            wake,
            retry: RetryPolicy::from_config(config),
            call_timeout: config.provider_call_timeout,
            idle_interval: config.idle_interval,
        }
    }

    /// Runs scheduling cycles until `shutdown` flips to `true`
    ///
    /// Between cycles the loop sleeps until something is enqueued, a
    /// provider turns healthy, or the idle interval passes.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting scheduler (idle interval: {:?})", self.idle_interval);

        loop {
            let started = self.run_cycle();
            if !started.is_empty() {
                debug!("Started {} dispatch(es) this cycle", started.len());
            }

            tokio::select! {
                _ = self.queue.wait_for_enqueue() => {}
                _ = self.wake.notified() => {}
                _ = time::sleep(self.idle_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped ({} execution(s) still queued)", self.queue.len());
    }

    /// Dispatches every queued execution that currently has a capable provider
    ///
    /// Returns the handles of the spawned dispatch tasks. The loop lets them
    /// run detached; tests await them.
    pub fn run_cycle(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        loop {
            let candidates = self.registry.candidates();
            if candidates.is_empty() {
                break;
            }

            let Some(queued) = self.queue.dequeue_next(|queued| {
                candidates
                    .iter()
                    .any(|candidate| candidate.supports(&queued.pipeline_type))
            }) else {
                break;
            };

            let Some(provider) = choose_provider(&candidates, &queued) else {
                self.queue.enqueue(queued);
                break;
            };

            if !self.registry.try_reserve(&provider) {
                // Lost the last slot to a concurrent change; retry next cycle
                self.queue.enqueue(queued);
                break;
            }

            let Some(execution) = self.tracker.get(queued.execution_id) else {
                debug!(
                    "Execution {} left the working set before dispatch",
                    queued.execution_id
                );
                self.registry.release(&provider);
                continue;
            };

            let scheduler = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                scheduler.dispatch(execution, provider).await;
            }));
        }

        handles
    }

    async fn dispatch(&self, execution: Execution, provider: String) {
        let id = execution.id;

        let Some(adapter) = self.registry.adapter(&provider) else {
            error!("Provider {} vanished while dispatching {}", provider, id);
            self.registry.release(&provider);
            self.finish_exhausted(
                id,
                Failure::new(
                    FailureCategory::InternalError,
                    format!("provider {} is no longer registered", provider),
                ),
                0,
            )
            .await;
            return;
        };

        let request = SubmitRequest {
            execution_id: id,
            repository: execution.repository,
            branch: execution.branch,
            environment: execution.environment,
            config: execution.config,
            parameters: execution.parameters,
        };

        match self.submit_with_retry(id, &provider, adapter.as_ref(), &request).await {
            Outcome::Accepted { reference, attempts } => {
                self.registry.record_accepted(&provider);
                self.commit(id, &provider, adapter.as_ref(), reference, attempts)
                    .await;
            }
            Outcome::Exhausted { error, attempts } => {
                self.registry.release(&provider);
                let category = match error {
                    ProviderError::Rejected(_) => FailureCategory::ProviderRejected,
                    _ => FailureCategory::ProviderTimeout,
                };
                warn!(
                    "Dispatch of execution {} to {} gave up after {} attempt(s): {}",
                    id, provider, attempts, error
                );
                let reason = format!(
                    "submit to {} failed after {} attempt(s): {}",
                    provider, attempts, error
                );
                self.finish_exhausted(id, Failure::new(category, reason), attempts)
                    .await;
            }
            Outcome::Cancelled { attempts } => {
                self.registry.release(&provider);
                info!("Execution {} cancelled before dispatch", id);
                if let Err(e) = self
                    .tracker
                    .transition(id, ExecutionEvent::CancelRequested, |execution| {
                        execution.dispatch_attempts = attempts;
                    })
                    .await
                {
                    debug!("Cancelled execution {} already settled: {}", id, e);
                }
            }
        }
    }

    async fn submit_with_retry(
        &self,
        id: Uuid,
        provider: &str,
        adapter: &dyn ProviderAdapter,
        request: &SubmitRequest,
    ) -> Outcome {
        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;

        loop {
            if self.tracker.is_cancel_requested(id) {
                return Outcome::Cancelled { attempts };
            }

            attempts += 1;
            info!(
                "Dispatching execution {} to {} (attempt {}/{})",
                id, provider, attempts, max_attempts
            );

            let result = match time::timeout(self.call_timeout, adapter.submit(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
            };

            match result {
                Ok(reference) => return Outcome::Accepted { reference, attempts },
                Err(error) if attempts >= max_attempts => {
                    return Outcome::Exhausted { error, attempts };
                }
                Err(error) => {
                    let delay = self.retry.delay(attempts);
                    warn!(
                        "Submit of execution {} to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        id, provider, attempts, max_attempts, error, delay
                    );
                    time::sleep(delay).await;
                }
            }
        }
    }

    /// Records an accepted job; cancels it at the provider if a stop arrived meanwhile
    async fn commit(
        &self,
        id: Uuid,
        provider: &str,
        adapter: &dyn ProviderAdapter,
        reference: String,
        attempts: u32,
    ) {
        let committed = self
            .tracker
            .transition(id, ExecutionEvent::Dispatched, |execution| {
                execution.provider = Some(provider.to_string());
                execution.provider_ref = Some(reference.clone());
                execution.dispatch_attempts = attempts;
            })
            .await;

        match committed {
            Ok(_) => {
                info!(
                    "Execution {} assigned to {} as {} after {} attempt(s)",
                    id, provider, reference, attempts
                );

                // Whoever performs the cancel transition owns the provider cancel
                if self.tracker.is_cancel_requested(id) {
                    match self
                        .tracker
                        .transition(id, ExecutionEvent::CancelRequested, |_| {})
                        .await
                    {
                        Ok(_) => {
                            self.cancel_at_provider(id, provider, adapter, &reference)
                                .await;
                        }
                        Err(e) => debug!("Execution {} settled before cancel: {}", id, e),
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Provider {} accepted execution {} but it can no longer be assigned: {}",
                    provider, id, e
                );
                self.registry.release(provider);
                self.cancel_at_provider(id, provider, adapter, &reference)
                    .await;
            }
        }
    }

    async fn cancel_at_provider(
        &self,
        id: Uuid,
        provider: &str,
        adapter: &dyn ProviderAdapter,
        reference: &str,
    ) {
        match time::timeout(self.call_timeout, adapter.cancel(reference)).await {
            Ok(Ok(ack)) => info!("Provider {} acknowledged cancel of {}: {:?}", provider, id, ack),
            Ok(Err(e)) => warn!("Provider {} could not cancel {}: {}", provider, id, e),
            Err(_) => warn!("Cancel of {} on {} timed out", id, provider),
        }
    }

    async fn finish_exhausted(&self, id: Uuid, failure: Failure, attempts: u32) {
        if let Err(e) = self
            .tracker
            .transition(id, ExecutionEvent::DispatchExhausted, |execution| {
                execution.failure = Some(failure);
                execution.dispatch_attempts = attempts;
            })
            .await
        {
            debug!("Execution {} not failed after dispatch: {}", id, e);
        }
    }
}

/// Picks the provider for one execution
///
/// The caller's hint wins if it names a capable candidate; otherwise the
/// least-loaded capable candidate, ties broken by name.
pub fn choose_provider(candidates: &[Candidate], queued: &QueuedExecution) -> Option<String> {
    let capable = candidates
        .iter()
        .filter(|candidate| candidate.supports(&queued.pipeline_type));

    if let Some(preferred) = &queued.provider_preference {
        if let Some(candidate) = capable.clone().find(|c| &c.name == preferred) {
            return Some(candidate.name.clone());
        }
    }

    capable
        .min_by(|a, b| a.in_flight.cmp(&b.in_flight).then_with(|| a.name.cmp(&b.name)))
        .map(|candidate| candidate.name.clone())
}
