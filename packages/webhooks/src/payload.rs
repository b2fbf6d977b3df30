//! JSON bodies sent to webhook targets.

use chrono::{DateTime, Utc};
use render_core::{AlertSeverity, Job, WebhookEventType};
use serde_json::{Value, json};

/// Backlog depth above which a `queue.backlog` alert is raised.
pub const BACKLOG_ALERT_THRESHOLD: usize = 50;

/// Body for job lifecycle events.
pub fn job_event_body(job: &Job, event_type: WebhookEventType, at: DateTime<Utc>) -> Value {
    json!({
        "event": event_type.as_str(),
        "job_id": job.id.to_string(),
        "job": {
            "id": job.id.to_string(),
            "symbol": job.symbol,
            "timeframe": job.timeframe,
            "status": job.status.as_str(),
            "priority": job.priority,
            "attempts": job.attempts,
            "created_at": job.created_at,
            "started_at": job.started_at,
            "finished_at": job.finished_at,
            "duration_ms": job.duration_ms,
            "error": job.error,
            "result": job.result,
        },
        "timestamp": at,
    })
}

/// Body for health alerts.
pub fn alert_body(
    alert_type: WebhookEventType,
    severity: AlertSeverity,
    message: &str,
    data: Value,
    at: DateTime<Utc>,
) -> Value {
    json!({
        "event": alert_type.as_str(),
        "alert_type": alert_type.as_str(),
        "severity": severity,
        "message": message,
        "data": data,
        "timestamp": at,
    })
}

/// Severity for a backlog of `depth` queued jobs.
pub fn backlog_severity(depth: usize) -> AlertSeverity {
    if depth > 100 {
        AlertSeverity::Critical
    } else if depth > 50 {
        AlertSeverity::High
    } else {
        AlertSeverity::Medium
    }
}
