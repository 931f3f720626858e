//! Provider DTOs
//!
//! Summaries exposed to callers, and the status views provider adapters hand
//! back to the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::provider::{ConnectionState, HealthStatus, PipelineType, ProviderCounters};
use crate::domain::stage::Stage;

/// Summary information about a registered provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSummary {
    /// Unique provider name
    pub name: String,

    /// Backend kind (jenkins, gitlab, ...)
    pub kind: String,

    /// Pipeline types this provider declared at registration
    pub capabilities: Vec<PipelineType>,

    pub enabled: bool,
    pub health: HealthStatus,
    pub connection: ConnectionState,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// Executions currently assigned to this provider
    pub in_flight: u32,

    /// Concurrency cap, if any
    pub max_concurrent: Option<u32>,

    pub counters: ProviderCounters,
}

/// Outcome of one health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub provider: String,
    pub healthy: bool,
    pub details: Option<String>,
    /// Health after hysteresis was applied
    pub status: HealthStatus,
    pub connection: ConnectionState,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: u64,
}

/// What a provider answered to `healthCheck()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub details: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            details: None,
        }
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self {
            healthy: false,
            details: Some(details.into()),
        }
    }
}

/// A provider's view of one submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub stages: Vec<Stage>,
    pub overall: RemoteState,
}

/// Overall job state as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Running,
    Completed,
    Failed { reason: String },
    /// The provider does not know the job (never received it, or purged it).
    Unknown,
}

/// Provider answer to a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The job was running and has been asked to stop.
    Cancelled,
    /// There was nothing to stop; the job already finished or never started.
    NotRunning,
}
