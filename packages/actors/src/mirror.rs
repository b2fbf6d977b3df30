//! Ordered, best-effort copy of queue state into the store.

use chrono::{DateTime, Utc};
use db::Store;
use render_core::{Job, JobId, JobStatus};
use tokio::sync::{mpsc, oneshot};

enum MirrorOp {
    UpsertJob(Box<Job>),
    UpdateQueued(Box<Job>),
    EnqueueRow {
        job_id: JobId,
        priority: i32,
        queued_at: DateTime<Utc>,
    },
    RemoveQueueRow(JobId),
    UpdatePositions(Vec<(JobId, usize)>),
    Barrier(oneshot::Sender<()>),
}

/// Handle to the mirror task.
///
/// Writes are applied one at a time in submission order, so a later state
/// of a job never gets overwritten by an earlier one. Failures are logged
/// and dropped; the in-memory queue stays authoritative for this process.
#[derive(Clone)]
pub struct StoreMirror {
    tx: mpsc::UnboundedSender<MirrorOp>,
}

impl StoreMirror {
    /// Spawn the mirror task. It exits once every handle is dropped.
    pub fn spawn(store: Store) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                apply(&store, op).await;
            }
            tracing::debug!("Store mirror stopped");
        });

        Self { tx }
    }

    fn send(&self, op: MirrorOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("Store mirror is gone, dropping write");
        }
    }

    pub fn upsert_job(&self, job: &Job) {
        self.send(MirrorOp::UpsertJob(Box::new(job.clone())));
    }

    /// Write a job that this process still holds as queued. Skipped in the
    /// store if the row has left `queued` in the meantime.
    pub fn update_queued(&self, job: &Job) {
        self.send(MirrorOp::UpdateQueued(Box::new(job.clone())));
    }

    pub fn enqueue_row(&self, job_id: JobId, priority: i32, queued_at: DateTime<Utc>) {
        self.send(MirrorOp::EnqueueRow {
            job_id,
            priority,
            queued_at,
        });
    }

    pub fn remove_queue_row(&self, job_id: JobId) {
        self.send(MirrorOp::RemoveQueueRow(job_id));
    }

    pub fn update_positions(&self, positions: Vec<(JobId, usize)>) {
        if !positions.is_empty() {
            self.send(MirrorOp::UpdatePositions(positions));
        }
    }

    /// Wait until every write submitted so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(MirrorOp::Barrier(tx));
        let _ = rx.await;
    }
}

async fn apply(store: &Store, op: MirrorOp) {
    match op {
        MirrorOp::UpsertJob(job) => {
            tracing::debug!(job_id = %job.id, status = %job.status, "Mirroring job");
            if let Err(e) = store.jobs.upsert(&job).await {
                tracing::warn!(job_id = %job.id, "Failed to persist job: {}", e);
            }
        }
        MirrorOp::UpdateQueued(job) => match store.jobs.update_if_queued(&job).await {
            Ok(Some(_)) => {
                let row = match (job.status, job.queued_at) {
                    (JobStatus::Queued, Some(queued_at)) => {
                        store.queue.upsert(job.id, job.priority, queued_at).await
                    }
                    _ => store.queue.remove(job.id).await,
                };
                if let Err(e) = row {
                    tracing::warn!(job_id = %job.id, "Failed to persist queue entry: {}", e);
                }
            }
            Ok(None) => {
                tracing::warn!(job_id = %job.id, status = %job.status, "Stored job is no longer queued, write skipped");
            }
            Err(e) => tracing::warn!(job_id = %job.id, "Failed to persist job: {}", e),
        },
        MirrorOp::EnqueueRow {
            job_id,
            priority,
            queued_at,
        } => {
            if let Err(e) = store.queue.upsert(job_id, priority, queued_at).await {
                tracing::warn!(job_id = %job_id, "Failed to persist queue entry: {}", e);
            }
        }
        MirrorOp::RemoveQueueRow(job_id) => {
            if let Err(e) = store.queue.remove(job_id).await {
                tracing::warn!(job_id = %job_id, "Failed to remove queue entry: {}", e);
            }
        }
        MirrorOp::UpdatePositions(positions) => {
            if let Err(e) = store.jobs.update_positions(&positions).await {
                tracing::warn!("Failed to persist queue positions: {}", e);
            }
        }
        MirrorOp::Barrier(done) => {
            let _ = done.send(());
        }
    }
}
