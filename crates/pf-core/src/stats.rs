//! Time-series snapshot types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{NodeId, NodeStatus, TrafficCounters};

/// Resolution of a snapshot series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    /// 5-minute buckets
    Fine,
    /// 1-hour buckets rolled up from `Fine`
    Hourly,
    /// 1-day buckets rolled up from `Hourly`
    Daily,
}

impl SeriesKind {
    pub const ALL: [SeriesKind; 3] = [SeriesKind::Fine, SeriesKind::Hourly, SeriesKind::Daily];

    /// Width of one bucket
    pub fn bucket(&self) -> Duration {
        match self {
            SeriesKind::Fine => Duration::minutes(5),
            SeriesKind::Hourly => Duration::hours(1),
            SeriesKind::Daily => Duration::days(1),
        }
    }

    /// How long snapshots of this series are kept
    pub fn retention(&self) -> Duration {
        match self {
            SeriesKind::Fine => Duration::hours(48),
            SeriesKind::Hourly => Duration::days(30),
            SeriesKind::Daily => Duration::days(365),
        }
    }

    /// The finer series this one is rolled up from
    pub fn source(&self) -> Option<SeriesKind> {
        match self {
            SeriesKind::Fine => None,
            SeriesKind::Hourly => Some(SeriesKind::Fine),
            SeriesKind::Daily => Some(SeriesKind::Hourly),
        }
    }
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesKind::Fine => write!(f, "fine"),
            SeriesKind::Hourly => write!(f, "hourly"),
            SeriesKind::Daily => write!(f, "daily"),
        }
    }
}

/// Compact per-node entry stored inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBreakdown {
    pub id: NodeId,
    pub name: String,
    pub online: u64,
    pub status: NodeStatus,
}

/// One aggregated point in a snapshot series.
///
/// Unique on `(series, timestamp)`; stores upsert on that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub series: SeriesKind,
    pub timestamp: DateTime<Utc>,
    pub online: u64,
    pub total_users: u64,
    pub active_users: u64,
    /// Bytes sent during this bucket
    pub tx: u64,
    /// Bytes received during this bucket
    pub rx: u64,
    pub online_nodes: u64,
    pub total_nodes: u64,
    pub nodes: Vec<NodeBreakdown>,
}

/// User counts supplied by the admin panel's store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCounts {
    pub total: u64,
    pub active: u64,
}

/// Dashboard summary: live totals plus the most recent fine snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total_nodes: u64,
    pub online_nodes: u64,
    pub error_nodes: u64,
    pub syncing_nodes: u64,
    pub online_users: u64,
    pub users: UserCounts,
    /// Cumulative counters across all nodes
    pub traffic: TrafficCounters,
    pub latest: Option<StatsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_rollup_chain() {
        assert_eq!(SeriesKind::Fine.source(), None);
        assert_eq!(SeriesKind::Hourly.source(), Some(SeriesKind::Fine));
        assert_eq!(SeriesKind::Daily.source(), Some(SeriesKind::Hourly));
    }

    #[test]
    fn test_retention_windows() {
        assert_eq!(SeriesKind::Fine.retention(), Duration::hours(48));
        assert_eq!(SeriesKind::Hourly.retention(), Duration::days(30));
        assert_eq!(SeriesKind::Daily.retention(), Duration::days(365));
    }
}
