//! Event types pushed to real-time observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobId, JobStatus};

/// Which lifecycle point a job update reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
    /// Job returned to the backlog after its worker was lost.
    Requeued,
    PriorityChanged,
    /// The job's rank in the backlog moved.
    PositionChanged,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Queued => "queued",
            JobEventKind::Started => "started",
            JobEventKind::Completed => "completed",
            JobEventKind::Failed => "failed",
            JobEventKind::Cancelled => "cancelled",
            JobEventKind::Requeued => "requeued",
            JobEventKind::PriorityChanged => "priority_changed",
            JobEventKind::PositionChanged => "position_changed",
        }
    }
}

/// Compact view of a job sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub symbol: String,
    pub timeframe: String,
    pub priority: i32,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0..=100, or -1 for failed jobs.
    pub progress: i32,
}

impl JobSnapshot {
    pub fn from_job(job: &Job, progress: i32) -> Self {
        Self {
            id: job.id,
            status: job.status,
            symbol: job.symbol.clone(),
            timeframe: job.timeframe.clone(),
            priority: job.priority,
            attempts: job.attempts,
            queue_position: job.queue_position,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.error.clone(),
            progress,
        }
    }
}

/// Messages delivered to notification observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    /// A job changed state or position.
    #[serde(rename = "job_update", rename_all = "camelCase")]
    JobUpdate {
        event_type: JobEventKind,
        job: JobSnapshot,
        timestamp: DateTime<Utc>,
    },
    /// Full pattern overlay state for a chart.
    #[serde(rename = "pattern:overlay")]
    PatternOverlay {
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Incremental change to a pattern overlay.
    #[serde(rename = "pattern:delta")]
    PatternDelta {
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl NotificationEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            NotificationEvent::JobUpdate { timestamp, .. } => *timestamp,
            NotificationEvent::PatternOverlay { timestamp, .. } => *timestamp,
            NotificationEvent::PatternDelta { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            NotificationEvent::JobUpdate { job, .. } => Some(job.id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            NotificationEvent::JobUpdate {
                event_type, job, ..
            } => format!("Job {} {} ({})", job.id, event_type.as_str(), job.status),
            NotificationEvent::PatternOverlay { .. } => "Pattern overlay".to_string(),
            NotificationEvent::PatternDelta { .. } => "Pattern delta".to_string(),
        }
    }
}
