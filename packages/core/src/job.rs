//! Job domain types for render work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Priority assigned when a caller does not pick one. Lower runs sooner.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job was created but not yet admitted to a queue.
    #[default]
    Pending,
    /// Job is waiting in a backlog.
    Queued,
    /// Job is being executed by a worker holding its lease.
    InProgress,
    /// Job finished successfully.
    Succeeded,
    /// Job failed or was cancelled.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Get a simple status string for display and store queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Human-readable summary of the result.
    pub summary: String,
    /// Optional structured output data as JSON (e.g. the artifact location).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl JobResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            output: None,
        }
    }

    pub fn with_output(summary: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            summary: summary.into(),
            output: Some(output),
        }
    }
}

/// A render job: one chart artifact for a symbol and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Instrument the artifact is rendered for.
    pub symbol: String,
    /// Chart timeframe, e.g. `1h`.
    pub timeframe: String,
    /// Opaque payload handed to the executor.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: JobStatus,
    /// Execution priority, lower is more urgent.
    pub priority: i32,
    /// Number of times execution started.
    #[serde(default)]
    pub attempts: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// When the job last entered a backlog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    /// 1-based rank in the local backlog while queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// Time spent queued before the last start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Webhook targets notified about this job's lifecycle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook_urls: Vec<String>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            payload,
            status: JobStatus::Pending,
            priority: DEFAULT_PRIORITY,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            queued_at: None,
            queue_position: None,
            wait_time_ms: None,
            error: None,
            result: None,
            webhook_urls: Vec::new(),
        }
    }

    /// Use a caller-chosen ID.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a webhook target for this job.
    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_urls.push(url.into());
        self
    }

    /// Move the job into a backlog.
    pub fn mark_queued(&mut self, priority: i32, at: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.priority = priority;
        self.queued_at = Some(at);
        self.started_at = None;
        self.updated_at = at;
    }

    /// Record that execution started.
    pub fn mark_in_progress(&mut self, at: DateTime<Utc>) {
        self.status = JobStatus::InProgress;
        self.attempts = self.attempts.saturating_add(1);
        self.started_at = Some(at);
        self.finished_at = None;
        self.duration_ms = None;
        self.queue_position = None;
        self.wait_time_ms = self.queued_at.map(|q| millis_between(q, at));
        self.error = None;
        self.updated_at = at;
    }

    /// Record a successful run.
    pub fn mark_succeeded(&mut self, result: JobResult, at: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.result = Some(result);
        self.error = None;
        self.finish(at);
    }

    /// Record a failed run, or a cancellation of a queued job.
    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.queue_position = None;
        self.finish(at);
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
        self.duration_ms = self.started_at.map(|s| millis_between(s, at));
        self.updated_at = at;
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn lifecycle_records_wait_and_duration() {
        let t0 = Utc::now();
        let mut job = Job::new("BTCUSD", "1h", serde_json::json!({}));
        job.mark_queued(10, t0);
        assert_eq!(job.status, JobStatus::Queued);

        job.mark_in_progress(t0 + Duration::milliseconds(250));
        assert_eq!(job.attempts, 1);
        assert_eq!(job.wait_time_ms, Some(250));

        job.mark_succeeded(JobResult::new("rendered"), t0 + Duration::milliseconds(1250));
        assert!(job.status.is_terminal());
        assert_eq!(job.duration_ms, Some(1000));
    }

    #[test]
    fn cancelled_job_has_no_duration() {
        let mut job = Job::new("ETHUSD", "4h", serde_json::Value::Null);
        job.mark_queued(DEFAULT_PRIORITY, Utc::now());
        job.mark_failed("Cancelled", Utc::now());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.duration_ms, None);
        assert_eq!(job.error.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
