use crate::cluster::ClusterSnapshot;
use crate::utilization::UtilizationIndex;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Read-only cycle state shared by every plugin of every profile in a cycle
#[derive(Debug, Clone)]
pub struct Handle {
    snapshot: Arc<ClusterSnapshot>,
    usage: Arc<UtilizationIndex>,
    now: DateTime<Utc>,
}

impl Handle {
    pub fn new(snapshot: Arc<ClusterSnapshot>, usage: Arc<UtilizationIndex>, now: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            usage,
            now,
        }
    }

    /// Handle over a snapshot with usage estimated from requests
    pub fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        let usage = UtilizationIndex::from_requests(&snapshot);
        let now = snapshot.observed_at();
        Self::new(Arc::new(snapshot), Arc::new(usage), now)
    }

    /// Handle with no cluster state, for validating plugin arguments
    pub fn empty() -> Self {
        Self::from_snapshot(ClusterSnapshot::empty())
    }

    pub fn snapshot(&self) -> &ClusterSnapshot {
        &self.snapshot
    }

    pub fn usage(&self) -> &UtilizationIndex {
        &self.usage
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
