//! Provider domain model
//!
//! A provider is an external CI/CD backend the orchestrator can hand work to.
//! These types describe what a provider can run and how it is doing; the
//! adapter contract itself lives in the orchestrator.

use serde::{Deserialize, Serialize};

/// Kind of pipeline a provider can run
///
/// Serialized as a plain snake_case string so configuration files can list
/// capabilities the core does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PipelineType {
    FullCicd,
    BuildOnly,
    TestOnly,
    DeployOnly,
    Custom(String),
}

impl PipelineType {
    pub fn as_str(&self) -> &str {
        match self {
            PipelineType::FullCicd => "full_cicd",
            PipelineType::BuildOnly => "build_only",
            PipelineType::TestOnly => "test_only",
            PipelineType::DeployOnly => "deploy_only",
            PipelineType::Custom(name) => name,
        }
    }
}

impl From<String> for PipelineType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "full_cicd" => PipelineType::FullCicd,
            "build_only" => PipelineType::BuildOnly,
            "test_only" => PipelineType::TestOnly,
            "deploy_only" => PipelineType::DeployOnly,
            _ => PipelineType::Custom(value),
        }
    }
}

impl From<&str> for PipelineType {
    fn from(value: &str) -> Self {
        PipelineType::from(value.to_string())
    }
}

impl From<PipelineType> for String {
    fn from(value: PipelineType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for PipelineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live health of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Whether the provider answered its last probe at all
///
/// Distinct from health: an overloaded provider can answer (connected) and
/// still report itself unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Monotonic execution counters for a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCounters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}
