//! Execution domain types
//!
//! An execution is one request to run a pipeline, tracked end-to-end from
//! submission to a terminal state. The state machine lives here so that every
//! component (dispatcher, tracker, stores) agrees on what is a legal move.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::provider::PipelineType;
use crate::domain::stage::Stage;
use crate::domain::template::PipelineConfig;

/// Execution record
///
/// Structure shared between the orchestrator (persists, dispatches) and the
/// stores (serialize it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub template_id: Option<String>,
    pub repository: String,
    pub branch: String,
    pub environment: String,
    pub config: PipelineConfig,
    pub parameters: HashMap<String, serde_json::Value>,
    /// Lower is more urgent.
    pub priority: i32,
    pub provider_preference: Option<String>,
    /// Set at dispatch time, never changed afterwards.
    pub provider: Option<String>,
    /// The provider's own handle for the submitted job.
    pub provider_ref: Option<String>,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<Stage>,
    pub failure: Option<Failure>,
    pub dispatch_attempts: u32,
}

impl Execution {
    pub fn pipeline_type(&self) -> &PipelineType {
        &self.config.pipeline_type
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds().max(0))
            }
            _ => None,
        }
    }
}

/// Execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Something that happened to an execution and may move it to a new state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A provider accepted the job via `submit()`.
    Dispatched,
    /// The provider reported the first stage as running.
    Started,
    /// Every stage reported completed.
    Finished,
    /// `submit()` kept failing until the retry budget ran out.
    DispatchExhausted,
    /// The provider reported failure, or lost the job after a stall.
    ProviderFailed,
    /// A caller asked to stop the execution.
    CancelRequested,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 6] = [
        ExecutionState::Queued,
        ExecutionState::Assigned,
        ExecutionState::Running,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// In flight means a provider holds the job.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ExecutionState::Assigned | ExecutionState::Running)
    }

    /// Apply an event, returning the next state or the rejected pair.
    pub fn transition(self, event: ExecutionEvent) -> Result<ExecutionState, TransitionError> {
        use ExecutionEvent as E;
        use ExecutionState as S;

        let next = match (self, event) {
            (S::Queued, E::Dispatched) => S::Assigned,
            (S::Assigned, E::Started) => S::Running,
            (S::Running, E::Finished) => S::Completed,
            (S::Queued, E::DispatchExhausted) => S::Failed,
            (S::Assigned | S::Running, E::ProviderFailed) => S::Failed,
            (S::Queued | S::Assigned | S::Running, E::CancelRequested) => S::Cancelled,
            (from, event) => return Err(TransitionError { from, event }),
        };

        Ok(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Queued => "queued",
            ExecutionState::Assigned => "assigned",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExecutionEvent {
    pub const ALL: [ExecutionEvent; 6] = [
        ExecutionEvent::Dispatched,
        ExecutionEvent::Started,
        ExecutionEvent::Finished,
        ExecutionEvent::DispatchExhausted,
        ExecutionEvent::ProviderFailed,
        ExecutionEvent::CancelRequested,
    ];
}

/// A rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: ExecutionState,
    pub event: ExecutionEvent,
}

/// Why an execution ended up `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub category: FailureCategory,
    pub reason: String,
}

impl Failure {
    pub fn new(category: FailureCategory, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
        }
    }
}

/// Coarse failure category
///
/// Separates "your pipeline failed" (`ProviderReportedFailure`) from "we could
/// not run it" (everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    ProviderRejected,
    ProviderTimeout,
    ProviderReportedFailure,
    InternalError,
}

impl FailureCategory {
    pub fn is_infrastructure(self) -> bool {
        !matches!(self, FailureCategory::ProviderReportedFailure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::ProviderRejected => "provider-rejected",
            FailureCategory::ProviderTimeout => "provider-timeout",
            FailureCategory::ProviderReportedFailure => "provider-reported-failure",
            FailureCategory::InternalError => "internal-error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provider-rejected" => Some(FailureCategory::ProviderRejected),
            "provider-timeout" => Some(FailureCategory::ProviderTimeout),
            "provider-reported-failure" => Some(FailureCategory::ProviderReportedFailure),
            "internal-error" => Some(FailureCategory::InternalError),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
