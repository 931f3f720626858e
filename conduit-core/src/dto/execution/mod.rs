//! Execution DTOs for the caller-facing operations

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::execution::ExecutionState;
use crate::domain::template::PipelineConfig;
use crate::dto::provider::CancelAck;

/// Request to run a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePipeline {
    pub repository: String,
    pub branch: String,
    pub environment: String,
    pub pipeline: PipelineSource,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Lower is more urgent; the orchestrator default applies when unset.
    pub priority: Option<i32>,
    /// Preferred provider name. A hint, not a guarantee.
    pub provider_preference: Option<String>,
}

/// Where the pipeline configuration comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    Config(PipelineConfig),
    Template(String),
}

/// Response to a successful `ExecutePipeline`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: Uuid,
    pub state: ExecutionState,
    /// Non-fatal problems, e.g. no registered provider can run this yet.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Filter for listing executions; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default)]
    pub states: Vec<ExecutionState>,
    pub provider: Option<String>,
    pub template_id: Option<String>,
    pub repository: Option<String>,
    pub environment: Option<String>,
}

impl ExecutionFilter {
    pub fn with_states(states: impl Into<Vec<ExecutionState>>) -> Self {
        Self {
            states: states.into(),
            ..Self::default()
        }
    }
}

/// Offset-based pagination
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: usize = 500;

    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: Self::MAX_LIMIT,
        }
    }
}

/// One page of results plus the total number of matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Acknowledgement of a `StopExecution` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAck {
    pub execution_id: Uuid,
    /// State right after the request was applied.
    pub state: ExecutionState,
    /// What the provider said when asked to cancel, if it was asked.
    pub provider_ack: Option<CancelAck>,
}
