//! Provider registry
//!
//! Holds every configured adapter, its cached capabilities and its live
//! state (health, connection, in-flight load, counters). Rebuilt from
//! configuration on start; never persisted.

use chrono::{DateTime, Utc};
use conduit_core::domain::execution::ExecutionState;
use conduit_core::domain::provider::{
    ConnectionState, HealthStatus, PipelineType, ProviderCounters,
};
use conduit_core::dto::provider::{HealthReport, ProviderSummary};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{OrchestratorError, ProviderError, Result};
use crate::provider::ProviderAdapter;

/// Registration options for one provider
#[derive(Debug, Clone, Copy)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub max_concurrent: Option<u32>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: None,
        }
    }
}

/// A provider the scheduler may dispatch to right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub capabilities: Vec<PipelineType>,
    pub in_flight: u32,
}

impl Candidate {
    pub fn supports(&self, pipeline_type: &PipelineType) -> bool {
        self.capabilities.contains(pipeline_type)
    }
}

/// Health after a probe result was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthChange {
    pub previous: HealthStatus,
    pub status: HealthStatus,
    pub connection: ConnectionState,
}

impl HealthChange {
    pub fn flipped(&self) -> bool {
        self.previous != self.status
    }
}

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    kind: String,
    capabilities: Vec<PipelineType>,
    enabled: bool,
    max_concurrent: Option<u32>,
    health: HealthStatus,
    connection: ConnectionState,
    consecutive_failures: u32,
    last_checked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    in_flight: u32,
    counters: ProviderCounters,
}

impl ProviderEntry {
    fn has_capacity(&self) -> bool {
        self.max_concurrent.is_none_or(|max| self.in_flight < max)
    }

    fn is_candidate(&self) -> bool {
        self.enabled
            && self.health == HealthStatus::Healthy
            && self.connection == ConnectionState::Connected
            && self.has_capacity()
    }

    fn summary(&self, name: &str) -> ProviderSummary {
        ProviderSummary {
            name: name.to_string(),
            kind: self.kind.clone(),
            capabilities: self.capabilities.clone(),
            enabled: self.enabled,
            health: self.health,
            connection: self.connection,
            last_checked_at: self.last_checked_at,
            last_error: self.last_error.clone(),
            in_flight: self.in_flight,
            max_concurrent: self.max_concurrent,
            counters: self.counters,
        }
    }
}

/// Registry of provider adapters and their live state
///
/// Read-mostly. Each record is written by one party at a time: the health
/// monitor for health fields, the dispatcher and tracker for load fields.
pub struct ProviderRegistry {
    entries: RwLock<BTreeMap<String, ProviderEntry>>,
    failure_threshold: u32,
}

impl ProviderRegistry {
    /// Creates an empty registry
    ///
    /// # Arguments
    /// * `failure_threshold` - consecutive failed probes before a provider is marked unhealthy
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ProviderEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ProviderEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an adapter
    ///
    /// Capabilities are queried once here and cached. The provider starts
    /// unhealthy and disconnected until its first successful probe.
    pub fn register(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        settings: ProviderSettings,
    ) -> Result<()> {
        let name = adapter.name().to_string();

        if name.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "Provider name cannot be empty".to_string(),
            ));
        }

        let mut entries = self.write();
        if entries.contains_key(&name) {
            return Err(OrchestratorError::Validation(format!(
                "Provider {} is already registered",
                name
            )));
        }

        let entry = ProviderEntry {
            kind: adapter.kind().to_string(),
            capabilities: adapter.capabilities(),
            adapter,
            enabled: settings.enabled,
            max_concurrent: settings.max_concurrent,
            health: HealthStatus::Unhealthy,
            connection: ConnectionState::Disconnected,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
            in_flight: 0,
            counters: ProviderCounters::default(),
        };

        tracing::info!(
            "Provider registered: {} ({}) capabilities={:?}",
            name,
            entry.kind,
            entry
                .capabilities
                .iter()
                .map(PipelineType::as_str)
                .collect::<Vec<_>>()
        );

        entries.insert(name, entry);
        Ok(())
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.read().get(name).map(|entry| Arc::clone(&entry.adapter))
    }

    /// Adapters of every enabled provider, in name order
    pub fn enabled_adapters(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.read()
            .values()
            .filter(|entry| entry.enabled)
            .map(|entry| Arc::clone(&entry.adapter))
            .collect()
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.read()
            .iter()
            .map(|(name, entry)| entry.summary(name))
            .collect()
    }

    pub fn summary(&self, name: &str) -> Option<ProviderSummary> {
        self.read().get(name).map(|entry| entry.summary(name))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Enables or disables a provider
    ///
    /// Disabled providers are never dispatch candidates and are not probed.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<ProviderSummary> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::ProviderNotFound(name.to_string()))?;

        if entry.enabled != enabled {
            entry.enabled = enabled;
            tracing::info!(
                "Provider {} {}",
                name,
                if enabled { "enabled" } else { "disabled" }
            );
        }

        Ok(entry.summary(name))
    }

    /// Providers that are enabled, healthy, connected and below their cap
    ///
    /// Sorted by name, which keeps load-balancing tie-breaks deterministic.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.read()
            .iter()
            .filter(|(_, entry)| entry.is_candidate())
            .map(|(name, entry)| Candidate {
                name: name.clone(),
                capabilities: entry.capabilities.clone(),
                in_flight: entry.in_flight,
            })
            .collect()
    }

    /// Whether any registered provider, healthy or not, declares this capability
    pub fn declares(&self, pipeline_type: &PipelineType) -> bool {
        self.read()
            .values()
            .any(|entry| entry.capabilities.contains(pipeline_type))
    }

    /// Applies one probe result with hysteresis
    ///
    /// A single success restores `healthy`; `failure_threshold` consecutive
    /// failures are needed to flip to `unhealthy`. Any reply marks the
    /// provider `connected`; unreachable probes only mark it `disconnected`
    /// once the same streak flips its health. Returns `None` for an unknown
    /// provider.
    pub fn record_probe(
        &self,
        name: &str,
        outcome: &std::result::Result<HealthReport, ProviderError>,
        checked_at: DateTime<Utc>,
    ) -> Option<HealthChange> {
        let mut entries = self.write();
        let entry = entries.get_mut(name)?;
        let previous = entry.health;

        entry.last_checked_at = Some(checked_at);

        let (failure, unreachable) = match outcome {
            Ok(report) => {
                entry.connection = ConnectionState::Connected;
                let failure = (!report.healthy).then(|| {
                    report
                        .details
                        .clone()
                        .unwrap_or_else(|| "provider reported unhealthy".to_string())
                });
                (failure, false)
            }
            Err(err) => (Some(err.to_string()), true),
        };

        match failure {
            None => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
                entry.health = HealthStatus::Healthy;
            }
            Some(error) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_error = Some(error);
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.health = HealthStatus::Unhealthy;
                    if unreachable {
                        entry.connection = ConnectionState::Disconnected;
                    }
                }
            }
        }

        Some(HealthChange {
            previous,
            status: entry.health,
            connection: entry.connection,
        })
    }

    /// Takes one in-flight slot if the provider is still a candidate
    ///
    /// Check and increment happen under one write lock, so two dispatches
    /// can never both take the last slot.
    pub fn try_reserve(&self, name: &str) -> bool {
        let mut entries = self.write();
        match entries.get_mut(name) {
            Some(entry) if entry.is_candidate() => {
                entry.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Re-attaches an execution that was already in flight before a restart
    pub fn restore_in_flight(&self, name: &str) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.in_flight += 1;
        }
    }

    /// Gives back a slot taken by `try_reserve` when the dispatch did not happen
    pub fn release(&self, name: &str) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Counts a job the provider accepted
    pub fn record_accepted(&self, name: &str) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.counters.total += 1;
        }
    }

    /// Frees the slot of a finished execution and updates counters
    pub fn record_finished(&self, name: &str, state: ExecutionState) {
        if let Some(entry) = self.write().get_mut(name) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            match state {
                ExecutionState::Completed => entry.counters.successful += 1,
                ExecutionState::Failed => entry.counters.failed += 1,
                _ => {}
            }
        }
    }
}
