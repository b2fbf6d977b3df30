//! Webhook outbox events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::JobId;

/// Unique identifier for a webhook event, also sent as the delivery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookEventId(pub Ulid);

impl WebhookEventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for WebhookEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WebhookEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a webhook event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "worker.offline")]
    WorkerOffline,
    #[serde(rename = "worker.overloaded")]
    WorkerOverloaded,
    #[serde(rename = "queue.backlog")]
    QueueBacklog,
    #[serde(rename = "jobs.orphaned")]
    JobsOrphaned,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::JobCompleted => "job.completed",
            WebhookEventType::JobFailed => "job.failed",
            WebhookEventType::JobCancelled => "job.cancelled",
            WebhookEventType::WorkerOffline => "worker.offline",
            WebhookEventType::WorkerOverloaded => "worker.overloaded",
            WebhookEventType::QueueBacklog => "queue.backlog",
            WebhookEventType::JobsOrphaned => "jobs.orphaned",
        }
    }

    /// Operational alerts have no owning job.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            WebhookEventType::WorkerOffline
                | WebhookEventType::WorkerOverloaded
                | WebhookEventType::QueueBacklog
                | WebhookEventType::JobsOrphaned
        )
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not delivered yet and still under the retry ceiling.
    #[default]
    Pending,
    Delivered,
    /// Retry ceiling reached; never sent again.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Severity attached to health alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

/// A notification persisted before delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: WebhookEventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub event_type: WebhookEventType,
    pub target_url: String,
    /// Exact JSON body sent on every attempt.
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        job_id: Option<JobId>,
        event_type: WebhookEventType,
        target_url: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: WebhookEventId::new(),
            job_id,
            event_type,
            target_url: target_url.into(),
            payload,
            attempts: 0,
            status: DeliveryStatus::Pending,
            last_attempt_at: None,
            delivered_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}
