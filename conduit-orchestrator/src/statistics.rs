//! Statistics aggregator
//!
//! Derives counts and rates from the execution store on demand. Nothing is
//! cached: every call reads the store's aggregate counts for the range.

use conduit_core::domain::execution::ExecutionState;
use conduit_core::dto::statistics::{GroupStats, Overview, Statistics, TimeRange};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::store::{CountRow, ExecutionStore, GroupBy};

/// Computes statistics for executions created within `range`
pub async fn collect(store: &dyn ExecutionStore, range: TimeRange) -> Result<Statistics> {
    let overall = store.aggregate_counts(range, GroupBy::Nothing).await?;
    let by_provider = store.aggregate_counts(range, GroupBy::Provider).await?;
    let by_template = store.aggregate_counts(range, GroupBy::Template).await?;

    Ok(Statistics {
        range,
        overview: overview(&overall),
        by_provider: grouped(&by_provider),
        by_template: grouped(&by_template),
    })
}

/// Folds `(state, count)` rows into one overview
pub fn overview(rows: &[CountRow]) -> Overview {
    let mut overview = Overview::default();
    let mut timed = 0u64;
    let mut total_duration_ms = 0i64;

    for row in rows {
        overview.total += row.count;
        match row.state {
            ExecutionState::Queued => overview.queued += row.count,
            ExecutionState::Assigned => overview.assigned += row.count,
            ExecutionState::Running => overview.running += row.count,
            ExecutionState::Completed => overview.completed += row.count,
            ExecutionState::Failed => overview.failed += row.count,
            ExecutionState::Cancelled => overview.cancelled += row.count,
        }

        // Only finished executions count towards the average duration
        if row.state.is_terminal() {
            timed += row.timed;
            total_duration_ms += row.total_duration_ms;
        }
    }

    let finished = overview.completed + overview.failed;
    if finished > 0 {
        overview.success_rate = Some(overview.completed as f64 / finished as f64);
    }
    if timed > 0 {
        overview.average_duration_ms = Some(total_duration_ms as f64 / timed as f64);
    }

    overview
}

fn grouped(rows: &[CountRow]) -> Vec<GroupStats> {
    let mut groups: BTreeMap<Option<String>, Vec<CountRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.key.clone()).or_default().push(row.clone());
    }

    groups
        .into_iter()
        .map(|(key, rows)| GroupStats {
            key,
            overview: overview(&rows),
        })
        .collect()
}
