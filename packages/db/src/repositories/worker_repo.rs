//! Worker registration repository.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use render_core::{WorkerRecord, WorkerStatus};
use serde::{Deserialize, Serialize};

use super::{StatusCount, status_map};
use crate::{Database, DbError, from_micros, to_micros};

/// Repository for `worker` rows.
#[derive(Clone)]
pub struct WorkerRepository {
    db: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerRow {
    worker_id: String,
    hostname: String,
    #[serde(default)]
    capabilities: Vec<String>,
    max_concurrent: i64,
    #[serde(default)]
    active_jobs: i64,
    status: WorkerStatus,
    last_heartbeat: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<&WorkerRecord> for WorkerRow {
    fn from(w: &WorkerRecord) -> Self {
        Self {
            worker_id: w.id.clone(),
            hostname: w.hostname.clone(),
            capabilities: w.capabilities.clone(),
            max_concurrent: w.max_concurrent as i64,
            active_jobs: w.active_jobs as i64,
            status: w.status,
            last_heartbeat: to_micros(w.last_heartbeat),
            created_at: to_micros(w.created_at),
            updated_at: to_micros(w.updated_at),
        }
    }
}

impl From<WorkerRow> for WorkerRecord {
    fn from(row: WorkerRow) -> Self {
        Self {
            id: row.worker_id,
            hostname: row.hostname,
            capabilities: row.capabilities,
            max_concurrent: row.max_concurrent.max(0) as usize,
            active_jobs: row.active_jobs.max(0) as usize,
            status: row.status,
            last_heartbeat: from_micros(row.last_heartbeat),
            created_at: from_micros(row.created_at),
            updated_at: from_micros(row.updated_at),
        }
    }
}

impl WorkerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a worker's registration.
    pub async fn upsert(&self, worker: &WorkerRecord) -> Result<WorkerRecord, DbError> {
        let row: Option<WorkerRow> = self
            .db
            .upsert(("worker", worker.id.as_str()))
            .content(WorkerRow::from(worker))
            .await?;

        row.map(WorkerRecord::from)
            .ok_or_else(|| DbError::Query(format!("Failed to write worker {}", worker.id)))
    }

    /// Heartbeat write: refresh liveness, load and status in one statement.
    ///
    /// Returns `None` if the row is gone or already stopped, so a worker that
    /// was declared dead does not resurrect itself.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        active_jobs: usize,
        status: WorkerStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE type::thing('worker', $worker_id)
                SET last_heartbeat = $at, updated_at = $at,
                    active_jobs = $active_jobs, status = $status
                WHERE status != "stopped"
                RETURN AFTER
                "#,
            )
            .bind(("worker_id", worker_id.to_string()))
            .bind(("at", to_micros(at)))
            .bind(("active_jobs", active_jobs as i64))
            .bind(("status", status))
            .await?;

        let rows: Vec<WorkerRow> = result.take(0)?;
        Ok(rows.into_iter().next().map(WorkerRecord::from))
    }

    /// Set a worker's status without touching its heartbeat.
    pub async fn set_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.db
            .query("UPDATE type::thing('worker', $worker_id) SET status = $status, updated_at = $at")
            .bind(("worker_id", worker_id.to_string()))
            .bind(("status", status))
            .bind(("at", to_micros(at)))
            .await?
            .check()?;
        Ok(())
    }

    /// Mark every other non-stopped worker whose heartbeat is older than
    /// `cutoff` as stopped, and return the rows that changed.
    ///
    /// The status guard means only one sweeper observes each transition.
    pub async fn mark_stale_stopped(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
        sweeper_id: &str,
    ) -> Result<Vec<WorkerRecord>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE worker
                SET status = "stopped", active_jobs = 0, updated_at = $at
                WHERE status != "stopped" AND last_heartbeat < $cutoff
                    AND worker_id != $sweeper_id
                RETURN BEFORE
                "#,
            )
            .bind(("cutoff", to_micros(cutoff)))
            .bind(("sweeper_id", sweeper_id.to_string()))
            .bind(("at", to_micros(at)))
            .await?;

        let rows: Vec<WorkerRow> = result.take(0)?;
        Ok(rows.into_iter().map(WorkerRecord::from).collect())
    }

    /// Get a worker by ID.
    pub async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DbError> {
        let row: Option<WorkerRow> = self.db.select(("worker", worker_id)).await?;
        Ok(row.map(WorkerRecord::from))
    }

    /// All registrations, most recently seen first.
    pub async fn list(&self) -> Result<Vec<WorkerRecord>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM worker ORDER BY last_heartbeat DESC")
            .await?;

        let rows: Vec<WorkerRow> = result.take(0)?;
        Ok(rows.into_iter().map(WorkerRecord::from).collect())
    }

    /// Count workers by status.
    pub async fn count_by_status(&self) -> Result<HashMap<String, u64>, DbError> {
        let mut result = self
            .db
            .query("SELECT status, count() AS count FROM worker GROUP BY status")
            .await?;

        let counts: Vec<StatusCount> = result.take(0)?;
        Ok(status_map(counts))
    }
}
