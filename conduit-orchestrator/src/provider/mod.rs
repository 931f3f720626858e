//! Provider layer
//!
//! Every CI/CD backend is reached through a `ProviderAdapter`. The registry
//! keeps the adapters and their live health; the health monitor probes them
//! on a fixed interval. The scheduler never branches on provider names or
//! kinds: it only sees capabilities and health.

pub mod health;
pub mod http;
pub mod registry;

pub use health::HealthMonitor;
pub use http::HttpProvider;
pub use registry::{Candidate, ProviderRegistry, ProviderSettings};

use async_trait::async_trait;
use conduit_core::domain::provider::PipelineType;
use conduit_core::domain::template::PipelineConfig;
use conduit_core::dto::provider::{CancelAck, HealthReport, ProviderStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ProviderError;

/// Handle a provider returns for an accepted job
pub type ProviderRef = String;

/// Everything a provider needs to run an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub execution_id: Uuid,
    pub repository: String,
    pub branch: String,
    pub environment: String,
    pub config: PipelineConfig,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Uniform capability contract implemented once per CI/CD backend
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique name this adapter is registered under
    fn name(&self) -> &str;

    /// Backend kind, for display only
    fn kind(&self) -> &str;

    /// Pipeline types this provider can run
    ///
    /// Static: queried once at registration and cached by the registry.
    fn capabilities(&self) -> Vec<PipelineType>;

    /// Hands a job to the provider
    ///
    /// Fails with `Rejected` if the provider will not take it and with
    /// `Unreachable` on network failure.
    async fn submit(&self, request: &SubmitRequest) -> Result<ProviderRef, ProviderError>;

    /// Current view of a submitted job
    ///
    /// Must be idempotent and monotonic: stages never regress between calls.
    async fn fetch_status(&self, reference: &str) -> Result<ProviderStatus, ProviderError>;

    /// Best-effort stop of a submitted job
    ///
    /// A provider that cannot cancel must return `CancelUnsupported` rather
    /// than silently succeeding.
    async fn cancel(&self, reference: &str) -> Result<CancelAck, ProviderError>;

    /// Liveness probe
    ///
    /// `Err` means the provider could not be reached at all; `Ok` with
    /// `healthy == false` means it answered but is not accepting work.
    async fn health_check(&self) -> Result<HealthReport, ProviderError>;
}
