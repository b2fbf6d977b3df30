//! Queue membership repository.

use chrono::{DateTime, Utc};
use render_core::JobId;
use serde::{Deserialize, Serialize};

use super::CountRow;
use crate::{Database, DbError, from_micros, to_micros};

/// Repository for `queue_entry` rows: which jobs wait in a backlog.
#[derive(Clone)]
pub struct QueueRepository {
    db: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntryRow {
    job_id: String,
    priority: i64,
    queued_at: i64,
}

/// A persisted backlog membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntryRecord {
    pub job_id: JobId,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
}

impl QueueEntryRow {
    fn into_record(self) -> Result<QueueEntryRecord, DbError> {
        let job_id = JobId::parse(&self.job_id)
            .map_err(|e| DbError::Serialization(format!("bad job id {}: {}", self.job_id, e)))?;
        Ok(QueueEntryRecord {
            job_id,
            priority: self.priority.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            queued_at: from_micros(self.queued_at),
        })
    }
}

impl QueueRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record that a job waits in a backlog, replacing any earlier entry.
    pub async fn upsert(
        &self,
        job_id: JobId,
        priority: i32,
        queued_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let row = QueueEntryRow {
            job_id: job_id.to_string(),
            priority: i64::from(priority),
            queued_at: to_micros(queued_at),
        };
        let _: Option<QueueEntryRow> = self
            .db
            .upsert(("queue_entry", job_id.to_string()))
            .content(row)
            .await?;
        Ok(())
    }

    /// Remove a job's backlog membership. Missing rows are fine.
    pub async fn remove(&self, job_id: JobId) -> Result<(), DbError> {
        let _: Option<QueueEntryRow> = self.db.delete(("queue_entry", job_id.to_string())).await?;
        Ok(())
    }

    /// All entries in dispatch order.
    pub async fn list(&self) -> Result<Vec<QueueEntryRecord>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM queue_entry ORDER BY priority ASC, queued_at ASC")
            .await?;

        let rows: Vec<QueueEntryRow> = result.take(0)?;
        rows.into_iter().map(QueueEntryRow::into_record).collect()
    }

    /// Number of jobs waiting across all workers.
    pub async fn count(&self) -> Result<u64, DbError> {
        let mut result = self
            .db
            .query("SELECT count() AS count FROM queue_entry GROUP ALL")
            .await?;

        let counts: Vec<CountRow> = result.take(0)?;
        Ok(counts.first().map_or(0, |c| c.count.max(0) as u64))
    }
}
