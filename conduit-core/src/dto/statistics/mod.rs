//! Statistics DTOs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Half-open time window `[from, to)` over execution creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// The window ending now and reaching `window` into the past.
    pub fn last(window: Duration) -> Self {
        let to = Utc::now();
        Self {
            from: to - window,
            to,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// Statistics over a time range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub range: TimeRange,
    pub overview: Overview,
    pub by_provider: Vec<GroupStats>,
    pub by_template: Vec<GroupStats>,
}

/// Counts per execution state plus derived rates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub total: u64,
    pub queued: u64,
    pub assigned: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// `completed / (completed + failed)`, or `None` when nothing finished.
    pub success_rate: Option<f64>,
    pub average_duration_ms: Option<f64>,
}

/// The same figures for one provider or one template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Provider name or template id; `None` groups executions without one.
    pub key: Option<String>,
    pub overview: Overview,
}
