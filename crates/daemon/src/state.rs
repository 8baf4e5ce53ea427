//! Run registry: in-memory status of every run this process has seen

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use testrunner_common::TestRunStatus;
use tracing::debug;

/// Concurrent `runId -> TestRunStatus` map.
///
/// Cheap to clone; clones share the same map. Each entry is guarded by its
/// shard, so updates to different runs do not contend and updates to the
/// same run are serialized.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<String, TestRunStatus>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any existing one for the same run
    pub fn create(&self, run_id: &str, status: TestRunStatus) {
        self.runs.insert(run_id.to_string(), status);
    }

    /// Snapshot of a run's record
    pub fn get(&self, run_id: &str) -> Option<TestRunStatus> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    /// Mutate a run's record in place; `None` when the run is unknown
    pub fn update<R>(&self, run_id: &str, f: impl FnOnce(&mut TestRunStatus) -> R) -> Option<R> {
        self.runs.get_mut(run_id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Drop terminal records that ended before `cutoff`; returns how many went
    pub fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.runs.len();
        self.runs.retain(|_, status| {
            !(status.status.is_terminal() && status.end_time.is_some_and(|end| end < cutoff))
        });
        let evicted = before.saturating_sub(self.runs.len());
        if evicted > 0 {
            debug!(evicted, "Evicted finished runs");
        }
        evicted
    }
}
