//! Message types for actor communication.

use chrono::{DateTime, Utc};
use render_core::{Job, JobId, QueueStats, QueueStatus};
use ractor::RpcReplyPort;

use crate::error::QueueError;
use crate::gate::Selection;

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Admit a new job. `priority` overrides the job's own when set.
    Enqueue {
        job: Box<Job>,
        priority: Option<i32>,
        reply: RpcReplyPort<Result<Job, QueueError>>,
    },

    /// Adopt jobs that are already queued in the store, keeping their
    /// original `queued_at`. Replies with how many were adopted.
    Restore {
        jobs: Vec<Job>,
        reply: RpcReplyPort<usize>,
    },

    /// Start as many backlog entries as there are free slots.
    ProcessNext,

    /// The dispatch gate finished choosing.
    Selected { selection: Selection },

    /// Drop queued jobs owned by another worker. Replies with how many
    /// were in the backlog.
    Evict {
        job_ids: Vec<JobId>,
        reply: RpcReplyPort<usize>,
    },

    /// A dispatched job reached a terminal state and was persisted.
    JobFinished { job: Box<Job> },

    /// Cancel a job that is still queued.
    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<Result<Job, QueueError>>,
    },

    /// Move a queued job to a new priority.
    UpdatePriority {
        job_id: JobId,
        priority: i32,
        reply: RpcReplyPort<Result<Job, QueueError>>,
    },

    /// Get a job by ID, queued, running or recently finished.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job>>,
    },

    GetJobPosition {
        job_id: JobId,
        reply: RpcReplyPort<Option<usize>>,
    },

    GetEstimatedStartTime {
        job_id: JobId,
        reply: RpcReplyPort<Option<DateTime<Utc>>>,
    },

    GetStatus { reply: RpcReplyPort<QueueStatus> },

    GetStats { reply: RpcReplyPort<QueueStats> },

    /// Drop finished jobs from memory after the store deleted them.
    Forget { job_ids: Vec<JobId> },

    /// Stop dispatching. Running jobs finish; queued jobs stay in the store.
    Stop { reply: RpcReplyPort<()> },
}
