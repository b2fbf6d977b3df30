//! Lease repository: the distributed lock.
//!
//! A lease row's record key is its job ID, and `lease.job_id` carries a
//! unique index, so creating a second lease for the same job fails inside
//! the store. Every mutation is scoped to `(job_id, worker_id)`.

use chrono::{DateTime, Utc};
use render_core::{JobId, Lease};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{Database, DbError, from_micros, to_micros};

/// Repository for lease rows.
#[derive(Clone)]
pub struct LeaseRepository {
    db: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRow {
    job_id: String,
    worker_id: String,
    leased_at: i64,
    expires_at: i64,
    token: String,
    #[serde(default)]
    renewed_count: u32,
}

impl LeaseRow {
    fn into_lease(self) -> Result<Lease, DbError> {
        let job_id = JobId::parse(&self.job_id)
            .map_err(|e| DbError::Serialization(format!("bad job id {}: {}", self.job_id, e)))?;
        Ok(Lease {
            job_id,
            worker_id: self.worker_id,
            leased_at: from_micros(self.leased_at),
            expires_at: from_micros(self.expires_at),
            token: self.token,
            renewed_count: self.renewed_count,
        })
    }
}

fn into_leases(rows: Vec<LeaseRow>) -> Result<Vec<Lease>, DbError> {
    rows.into_iter().map(LeaseRow::into_lease).collect()
}

impl LeaseRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Try to take the lease on a job.
    ///
    /// Returns `Ok(None)` when another lease row already exists for the job,
    /// live or not. Expired rows are only cleared by [`Self::take_expired`].
    pub async fn acquire(
        &self,
        job_id: JobId,
        worker_id: &str,
        leased_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Lease>, DbError> {
        let row = LeaseRow {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            leased_at: to_micros(leased_at),
            expires_at: to_micros(expires_at),
            token: Ulid::new().to_string(),
            renewed_count: 0,
        };

        let created: Result<Option<LeaseRow>, surrealdb::Error> = self
            .db
            .create(("lease", job_id.to_string()))
            .content(row)
            .await;

        match created {
            Ok(Some(row)) => row.into_lease().map(Some),
            Ok(None) => Ok(None),
            Err(e) => {
                // A failed insert on an existing key is contention, anything
                // else is a store failure.
                if self.get(job_id).await?.is_some() {
                    tracing::debug!(job_id = %job_id, "Lease already held: {}", e);
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Push a lease's expiry out. Returns `None` if this worker no longer holds it.
    pub async fn renew(
        &self,
        job_id: JobId,
        worker_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Lease>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                UPDATE type::thing('lease', $job_id)
                SET expires_at = $expires_at, renewed_count += 1
                WHERE worker_id = $worker_id
                RETURN AFTER
                "#,
            )
            .bind(("job_id", job_id.to_string()))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("expires_at", to_micros(expires_at)))
            .await?;

        let rows: Vec<LeaseRow> = result.take(0)?;
        rows.into_iter().next().map(LeaseRow::into_lease).transpose()
    }

    /// Delete this worker's lease on a job. Returns whether a row was removed.
    pub async fn release(&self, job_id: JobId, worker_id: &str) -> Result<bool, DbError> {
        let mut result = self
            .db
            .query("DELETE type::thing('lease', $job_id) WHERE worker_id = $worker_id RETURN BEFORE")
            .bind(("job_id", job_id.to_string()))
            .bind(("worker_id", worker_id.to_string()))
            .await?;

        let rows: Vec<LeaseRow> = result.take(0)?;
        Ok(!rows.is_empty())
    }

    /// Delete every lease a worker holds and return them.
    pub async fn release_all(&self, worker_id: &str) -> Result<Vec<Lease>, DbError> {
        let mut result = self
            .db
            .query("DELETE lease WHERE worker_id = $worker_id RETURN BEFORE")
            .bind(("worker_id", worker_id.to_string()))
            .await?;

        let rows: Vec<LeaseRow> = result.take(0)?;
        into_leases(rows)
    }

    /// Delete and return every lease whose expiry has passed.
    pub async fn take_expired(&self, now: DateTime<Utc>) -> Result<Vec<Lease>, DbError> {
        let mut result = self
            .db
            .query("DELETE lease WHERE expires_at <= $now RETURN BEFORE")
            .bind(("now", to_micros(now)))
            .await?;

        let rows: Vec<LeaseRow> = result.take(0)?;
        into_leases(rows)
    }

    /// IDs of jobs holding a live lease.
    pub async fn live_job_ids(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, DbError> {
        let mut result = self
            .db
            .query("SELECT VALUE job_id FROM lease WHERE expires_at > $now")
            .bind(("now", to_micros(now)))
            .await?;

        let ids: Vec<String> = result.take(0)?;
        Ok(ids
            .iter()
            .filter_map(|id| JobId::parse(id).ok())
            .collect())
    }

    /// IDs of jobs with a live lease held by any worker other than `worker_id`.
    pub async fn live_held_by_others(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, DbError> {
        let mut result = self
            .db
            .query("SELECT VALUE job_id FROM lease WHERE expires_at > $now AND worker_id != $worker_id")
            .bind(("worker_id", worker_id.to_string()))
            .bind(("now", to_micros(now)))
            .await?;

        let ids: Vec<String> = result.take(0)?;
        Ok(ids
            .iter()
            .filter_map(|id| JobId::parse(id).ok())
            .collect())
    }

    /// Get the lease row for a job, live or expired.
    pub async fn get(&self, job_id: JobId) -> Result<Option<Lease>, DbError> {
        let row: Option<LeaseRow> = self.db.select(("lease", job_id.to_string())).await?;
        row.map(LeaseRow::into_lease).transpose()
    }

    /// Leases currently held by a worker.
    pub async fn list_for_worker(&self, worker_id: &str) -> Result<Vec<Lease>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM lease WHERE worker_id = $worker_id")
            .bind(("worker_id", worker_id.to_string()))
            .await?;

        let rows: Vec<LeaseRow> = result.take(0)?;
        into_leases(rows)
    }
}
