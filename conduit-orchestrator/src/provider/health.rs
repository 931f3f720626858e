//! Health monitor
//!
//! Probes every enabled provider on a fixed interval and feeds the results
//! into the registry. Each provider's probe is offset by a small, stable
//! jitter so that probes for many providers do not fire in lockstep.

use chrono::Utc;
use conduit_core::domain::provider::{ConnectionState, HealthStatus};
use conduit_core::dto::provider::{HealthReport, HealthResult};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::provider::{ProviderAdapter, ProviderRegistry};
use crate::store::ExecutionStore;

/// Periodic prober of provider health
pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn ExecutionStore>,
    interval: Duration,
    timeout: Duration,
    wake: Arc<Notify>,
}

impl HealthMonitor {
    /// Creates a health monitor
    ///
    /// # Arguments
    /// * `interval` - time between probe rounds
    /// * `timeout` - per-probe timeout; a probe that takes longer counts as a failure
    /// * `wake` - notified whenever a provider is healthy after a probe, so the
    ///   scheduler can retry queued work without waiting for its idle timer
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn ExecutionStore>,
        interval: Duration,
        timeout: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            store,
            interval,
            timeout,
            wake,
        }
    }

    /// Probes every enabled provider once, concurrently, and returns the results
    pub async fn check_all(&self) -> Vec<HealthResult> {
        self.probe_round(false).await
    }

    /// Runs probe rounds until `shutdown` flips to `true`
    ///
    /// The first round starts immediately so newly registered providers do
    /// not wait a full interval before they can receive work.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting health monitor (interval: {:?})", self.interval);

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let results = self.probe_round(true).await;
                    debug!("Health round finished: {} provider(s) probed", results.len());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }

    async fn probe_round(&self, jitter: bool) -> Vec<HealthResult> {
        let mut probes = JoinSet::new();

        for adapter in self.registry.enabled_adapters() {
            let delay = if jitter {
                jitter_for(adapter.name(), self.interval)
            } else {
                Duration::ZERO
            };
            let timeout = self.timeout;

            probes.spawn(async move {
                if !delay.is_zero() {
                    time::sleep(delay).await;
                }
                probe(adapter, timeout).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(probe) => {
                    if let Some(result) = self.apply(probe).await {
                        results.push(result);
                    }
                }
                Err(e) => warn!("Health probe task panicked: {}", e),
            }
        }

        results.sort_by(|a, b| a.provider.cmp(&b.provider));
        results
    }

    async fn apply(&self, probe: Probe) -> Option<HealthResult> {
        let checked_at = Utc::now();
        let change = self
            .registry
            .record_probe(&probe.provider, &probe.outcome, checked_at)?;

        if change.flipped() {
            match change.status {
                HealthStatus::Healthy => info!("Provider {} is now healthy", probe.provider),
                HealthStatus::Unhealthy => warn!(
                    "Provider {} is now unhealthy: {}",
                    probe.provider,
                    describe(&probe.outcome)
                ),
            }
        }

        if change.status == HealthStatus::Healthy && change.connection == ConnectionState::Connected
        {
            self.wake.notify_one();
        }

        let (healthy, details) = match &probe.outcome {
            Ok(report) => (report.healthy, report.details.clone()),
            Err(e) => (false, Some(e.to_string())),
        };

        let result = HealthResult {
            provider: probe.provider,
            healthy,
            details,
            status: change.status,
            connection: change.connection,
            checked_at,
            response_time_ms: u64::try_from(probe.elapsed.as_millis()).unwrap_or(u64::MAX),
        };

        if let Err(e) = self.store.record_health(&result).await {
            warn!(
                "Failed to record health snapshot for {}: {}",
                result.provider, e
            );
        }

        Some(result)
    }
}

struct Probe {
    provider: String,
    outcome: Result<HealthReport, ProviderError>,
    elapsed: Duration,
}

async fn probe(adapter: Arc<dyn ProviderAdapter>, timeout: Duration) -> Probe {
    let started = Instant::now();
    let outcome = match time::timeout(timeout, adapter.health_check()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    };

    Probe {
        provider: adapter.name().to_string(),
        outcome,
        elapsed: started.elapsed(),
    }
}

fn describe(outcome: &Result<HealthReport, ProviderError>) -> String {
    match outcome {
        Ok(report) => report
            .details
            .clone()
            .unwrap_or_else(|| "reported unhealthy".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Stable per-provider offset, at most a tenth of the interval
fn jitter_for(name: &str, interval: Duration) -> Duration {
    let bound = interval.as_millis() as u64 / 10;
    if bound == 0 {
        return Duration::ZERO;
    }

    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % bound)
}
