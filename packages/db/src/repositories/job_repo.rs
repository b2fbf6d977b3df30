//! Job repository for CRUD operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use render_core::{Job, JobId, JobResult, JobStatus};
use serde::{Deserialize, Serialize};

use super::{StatusCount, status_map};
use crate::{Database, DbError, from_micros, to_micros};

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Internal record type for SurrealDB. The record key is the job ID; the
/// SurrealDB `id` field itself is never read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: String,
    symbol: String,
    timeframe: String,
    #[serde(default)]
    payload: serde_json::Value,
    status: JobStatus,
    priority: i64,
    #[serde(default)]
    attempts: u32,
    created_at: i64,
    updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queued_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<JobResult>,
    #[serde(default)]
    webhook_urls: Vec<String>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            symbol: job.symbol.clone(),
            timeframe: job.timeframe.clone(),
            payload: job.payload.clone(),
            status: job.status,
            priority: i64::from(job.priority),
            attempts: job.attempts,
            created_at: to_micros(job.created_at),
            updated_at: to_micros(job.updated_at),
            started_at: job.started_at.map(to_micros),
            finished_at: job.finished_at.map(to_micros),
            duration_ms: job.duration_ms,
            queued_at: job.queued_at.map(to_micros),
            queue_position: job.queue_position.map(|p| p as u64),
            wait_time_ms: job.wait_time_ms,
            error: job.error.clone(),
            result: job.result.clone(),
            webhook_urls: job.webhook_urls.clone(),
        }
    }
}

impl JobRecord {
    fn into_job(self) -> Result<Job, DbError> {
        let id = JobId::parse(&self.job_id)
            .map_err(|e| DbError::Serialization(format!("bad job id {}: {}", self.job_id, e)))?;
        Ok(Job {
            id,
            symbol: self.symbol,
            timeframe: self.timeframe,
            payload: self.payload,
            status: self.status,
            priority: self.priority.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
            attempts: self.attempts,
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
            started_at: self.started_at.map(from_micros),
            finished_at: self.finished_at.map(from_micros),
            duration_ms: self.duration_ms,
            queued_at: self.queued_at.map(from_micros),
            queue_position: self.queue_position.map(|p| p as usize),
            wait_time_ms: self.wait_time_ms,
            error: self.error,
            result: self.result,
            webhook_urls: self.webhook_urls,
        })
    }
}

#[derive(Debug, Serialize)]
struct PositionRow {
    job_id: String,
    position: i64,
}

fn into_jobs(records: Vec<JobRecord>) -> Vec<Job> {
    records
        .into_iter()
        .filter_map(|r| match r.into_job() {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!("Skipping unreadable job row: {}", e);
                None
            }
        })
        .collect()
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or fully replace a job row.
    pub async fn upsert(&self, job: &Job) -> Result<Job, DbError> {
        let record: Option<JobRecord> = self
            .db
            .upsert(("job", job.id.to_string()))
            .content(JobRecord::from(job))
            .await?;

        record
            .ok_or_else(|| DbError::Query(format!("Failed to write job {}", job.id)))?
            .into_job()
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Get a job by ID, if it exists.
    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;
        record.map(JobRecord::into_job).transpose()
    }

    /// List jobs with the given status in dispatch order.
    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM job WHERE status = $status ORDER BY priority ASC, queued_at ASC")
            .bind(("status", status))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(into_jobs(records))
    }

    /// Move an `in_progress` job back to `queued`.
    ///
    /// Returns `None` when the job was not in progress, which makes the
    /// transition happen exactly once even if several workers race on it.
    pub async fn requeue(&self, id: JobId, at: DateTime<Utc>) -> Result<Option<Job>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE type::thing('job', $job_id)
                SET status = "queued", queued_at = $at, updated_at = $at,
                    started_at = NONE, queue_position = NONE
                WHERE status = "in_progress"
                RETURN AFTER
                "#,
            )
            .bind(("job_id", id.to_string()))
            .bind(("at", to_micros(at)))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        records.into_iter().next().map(JobRecord::into_job).transpose()
    }

    /// Jobs marked in progress that hold no lease row at all.
    pub async fn in_progress_without_lease(&self) -> Result<Vec<Job>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT * FROM job
                WHERE status = "in_progress"
                AND job_id NOT IN (SELECT VALUE job_id FROM lease)
                "#,
            )
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(into_jobs(records))
    }

    /// Replace a job row only while the stored job is still queued.
    ///
    /// Returns `None` when the row has moved on, for example because another
    /// worker leased and started the job.
    pub async fn update_if_queued(&self, job: &Job) -> Result<Option<Job>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE type::thing('job', $job_id)
                CONTENT $record
                WHERE status = "queued"
                RETURN AFTER
                "#,
            )
            .bind(("job_id", job.id.to_string()))
            .bind(("record", JobRecord::from(job)))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        records.into_iter().next().map(JobRecord::into_job).transpose()
    }

    /// Store recomputed backlog positions in one statement. Rows that are
    /// no longer queued keep their value.
    pub async fn update_positions(&self, positions: &[(JobId, usize)]) -> Result<(), DbError> {
        if positions.is_empty() {
            return Ok(());
        }
        let rows: Vec<PositionRow> = positions
            .iter()
            .map(|(id, position)| PositionRow {
                job_id: id.to_string(),
                position: *position as i64,
            })
            .collect();

        self.db
            .query(
                r#"
                FOR $row IN $rows {
                    UPDATE type::thing('job', $row.job_id)
                    SET queue_position = $row.position
                    WHERE status = "queued";
                };
                "#,
            )
            .bind(("rows", rows))
            .await?
            .check()?;
        Ok(())
    }

    /// Delete terminal jobs that finished before `cutoff`. Returns their IDs.
    pub async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                DELETE job
                WHERE status IN ["succeeded", "failed"] AND finished_at < $cutoff
                RETURN BEFORE
                "#,
            )
            .bind(("cutoff", to_micros(cutoff)))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;
        Ok(into_jobs(records).into_iter().map(|j| j.id).collect())
    }

    /// Delete a job.
    pub async fn delete(&self, id: JobId) -> Result<(), DbError> {
        let _: Option<JobRecord> = self.db.delete(("job", id.to_string())).await?;
        Ok(())
    }

    /// Count jobs by status.
    pub async fn count_by_status(&self) -> Result<HashMap<String, u64>, DbError> {
        let mut result = self
            .db
            .query("SELECT status, count() AS count FROM job GROUP BY status")
            .await?;

        let counts: Vec<StatusCount> = result.take(0)?;
        Ok(status_map(counts))
    }
}
