//! Read models describing backlog and cluster state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, WorkerStatus};

/// A queued job's rank in the local backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub job_id: JobId,
    /// 1-based rank by `(priority, queued_at)`.
    pub position: usize,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
}

/// Snapshot of one process's backlog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub in_progress: usize,
    pub max_concurrent: usize,
    /// Positions in dispatch order.
    pub positions: Vec<QueuePosition>,
}

impl QueueStatus {
    pub fn position_of(&self, job_id: JobId) -> Option<usize> {
        self.positions
            .iter()
            .find(|p| p.job_id == job_id)
            .map(|p| p.position)
    }

    /// Free execution slots.
    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.in_progress)
    }
}

/// Running totals for jobs this process finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    pub succeeded: u64,
    pub failed: u64,
    /// Average job duration in milliseconds.
    pub avg_duration_ms: Option<f64>,
}

impl QueueStats {
    /// Total processed jobs.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.processed();
        if total == 0 {
            None
        } else {
            Some((self.succeeded as f64 / total as f64) * 100.0)
        }
    }

    /// Fold a finished job's duration into the running average.
    pub fn record_duration(&mut self, duration_ms: u64) {
        let n = self.processed().max(1) as f64;
        let previous = self.avg_duration_ms.unwrap_or(duration_ms as f64);
        self.avg_duration_ms = Some(previous + (duration_ms as f64 - previous) / n);
    }
}

/// Cluster-wide view combined with this worker's local backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedStats {
    pub worker_id: String,
    pub worker_status: WorkerStatus,
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub local: QueueStatus,
    pub local_stats: QueueStats,
    /// Worker count keyed by status string.
    pub workers: HashMap<String, u64>,
    pub live_leases: usize,
    /// Persisted job count keyed by status string.
    pub jobs: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_tracks_durations() {
        let mut stats = QueueStats::default();
        stats.succeeded = 1;
        stats.record_duration(100);
        stats.succeeded = 2;
        stats.record_duration(300);
        assert_eq!(stats.avg_duration_ms, Some(200.0));
        assert_eq!(stats.success_rate(), Some(100.0));
    }
}
