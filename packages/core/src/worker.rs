//! Worker registration records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a worker process.
///
/// `starting → active ⇄ idle → draining → stopped`; `stopped` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Starting,
    Active,
    Idle,
    Draining,
    Stopped,
}

impl WorkerStatus {
    /// Whether a worker in this state may take new leases.
    pub fn admits_jobs(&self) -> bool {
        !matches!(self, WorkerStatus::Draining | WorkerStatus::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker's shared registration, refreshed by its heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub hostname: String,
    /// Free-form capability tags, e.g. renderer versions.
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent: usize,
    pub active_jobs: usize,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, max_concurrent: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            hostname: hostname.into(),
            capabilities: Vec::new(),
            max_concurrent,
            active_jobs: 0,
            status: WorkerStatus::Starting,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Load relative to capacity, from 0.0 to 1.0 (or above when over-committed).
    pub fn load(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        self.active_jobs as f64 / self.max_concurrent as f64
    }
}
