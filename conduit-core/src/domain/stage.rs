//! Stage domain types
//!
//! A stage is one named phase of a running execution (build, package,
//! deploy, ...). Stage order is declared by the provider; stage state only
//! ever moves forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One named phase of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub state: StageState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Stage execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageState {
    fn rank(self) -> u8 {
        match self {
            StageState::Pending => 0,
            StageState::Running => 1,
            StageState::Completed | StageState::Failed => 2,
        }
    }

    /// Whether a stage in this state may move to `next`.
    ///
    /// Staying in the same state is allowed; anything that lowers the rank,
    /// or swaps one finished state for the other, is a regression.
    pub fn can_advance_to(self, next: StageState) -> bool {
        self == next || next.rank() > self.rank()
    }

    pub fn is_finished(self) -> bool {
        matches!(self, StageState::Completed | StageState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StageState::Pending),
            "running" => Some(StageState::Running),
            "completed" => Some(StageState::Completed),
            "failed" => Some(StageState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Stage {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StageState::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Merge a newer observation of the same stage into this one.
    ///
    /// Returns `true` if anything changed. Observations that would move the
    /// stage backwards are ignored, so the result is monotonic no matter how
    /// stale the reporter is.
    pub fn merge(&mut self, observed: &Stage) -> bool {
        if observed.state == self.state || !self.state.can_advance_to(observed.state) {
            return false;
        }

        let now = Utc::now();
        self.state = observed.state;

        if self.started_at.is_none() && observed.state != StageState::Pending {
            self.started_at = Some(observed.started_at.unwrap_or(now));
        }

        if observed.state.is_finished() {
            let completed_at = observed.completed_at.unwrap_or(now);
            self.completed_at = Some(completed_at);
            self.duration_ms = observed.duration_ms.or_else(|| {
                self.started_at
                    .map(|started| (completed_at - started).num_milliseconds().max(0))
            });
        }

        true
    }
}
