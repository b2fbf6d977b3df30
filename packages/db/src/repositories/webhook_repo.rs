//! Webhook outbox repository.

use chrono::{DateTime, Utc};
use render_core::{DeliveryStatus, JobId, WebhookEvent, WebhookEventId, WebhookEventType};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError, from_micros, to_micros};

/// Repository for `webhook_event` rows.
#[derive(Clone)]
pub struct WebhookRepository {
    db: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookRow {
    event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    event_type: WebhookEventType,
    target_url: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    attempts: u32,
    status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delivered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: i64,
}

impl From<&WebhookEvent> for WebhookRow {
    fn from(e: &WebhookEvent) -> Self {
        Self {
            event_id: e.id.to_string(),
            job_id: e.job_id.map(|id| id.to_string()),
            event_type: e.event_type,
            target_url: e.target_url.clone(),
            payload: e.payload.clone(),
            attempts: e.attempts,
            status: e.status,
            last_attempt_at: e.last_attempt_at.map(to_micros),
            delivered_at: e.delivered_at.map(to_micros),
            error: e.error.clone(),
            created_at: to_micros(e.created_at),
        }
    }
}

impl WebhookRow {
    fn into_event(self) -> Result<WebhookEvent, DbError> {
        let id = WebhookEventId::parse(&self.event_id)
            .map_err(|e| DbError::Serialization(format!("bad event id {}: {}", self.event_id, e)))?;
        let job_id = self
            .job_id
            .as_deref()
            .map(JobId::parse)
            .transpose()
            .map_err(|e| DbError::Serialization(format!("bad job id on event {}: {}", id, e)))?;
        Ok(WebhookEvent {
            id,
            job_id,
            event_type: self.event_type,
            target_url: self.target_url,
            payload: self.payload,
            attempts: self.attempts,
            status: self.status,
            last_attempt_at: self.last_attempt_at.map(from_micros),
            delivered_at: self.delivered_at.map(from_micros),
            error: self.error,
            created_at: from_micros(self.created_at),
        })
    }
}

fn into_events(rows: Vec<WebhookRow>) -> Vec<WebhookEvent> {
    rows.into_iter()
        .filter_map(|r| match r.into_event() {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Skipping unreadable webhook row: {}", e);
                None
            }
        })
        .collect()
}

impl WebhookRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new outbox event.
    pub async fn insert(&self, event: &WebhookEvent) -> Result<WebhookEvent, DbError> {
        let row: Option<WebhookRow> = self
            .db
            .create(("webhook_event", event.id.to_string()))
            .content(WebhookRow::from(event))
            .await?;

        row.ok_or_else(|| DbError::Query(format!("Failed to create webhook event {}", event.id)))?
            .into_event()
    }

    /// Write back an event after a delivery attempt.
    pub async fn save(&self, event: &WebhookEvent) -> Result<(), DbError> {
        let _: Option<WebhookRow> = self
            .db
            .upsert(("webhook_event", event.id.to_string()))
            .content(WebhookRow::from(event))
            .await?;
        Ok(())
    }

    /// Get an event by ID.
    pub async fn get(&self, id: WebhookEventId) -> Result<Option<WebhookEvent>, DbError> {
        let row: Option<WebhookRow> = self.db.select(("webhook_event", id.to_string())).await?;
        row.map(WebhookRow::into_event).transpose()
    }

    /// Undelivered events still under the attempt ceiling, oldest first.
    pub async fn pending(&self, max_attempts: u32, limit: usize) -> Result<Vec<WebhookEvent>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT * FROM webhook_event
                WHERE status = "pending" AND attempts < $max_attempts
                ORDER BY created_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("max_attempts", i64::from(max_attempts)))
            .bind(("limit", limit as i64))
            .await?;

        let rows: Vec<WebhookRow> = result.take(0)?;
        Ok(into_events(rows))
    }

    /// Events recorded for one job, oldest first.
    pub async fn list_for_job(&self, job_id: JobId) -> Result<Vec<WebhookEvent>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM webhook_event WHERE job_id = $job_id ORDER BY created_at ASC")
            .bind(("job_id", job_id.to_string()))
            .await?;

        let rows: Vec<WebhookRow> = result.take(0)?;
        Ok(into_events(rows))
    }

    /// Events of one type, oldest first.
    pub async fn list_by_type(&self, event_type: WebhookEventType) -> Result<Vec<WebhookEvent>, DbError> {
        let mut result = self
            .db
            .query("SELECT * FROM webhook_event WHERE event_type = $event_type ORDER BY created_at ASC")
            .bind(("event_type", event_type))
            .await?;

        let rows: Vec<WebhookRow> = result.take(0)?;
        Ok(into_events(rows))
    }

    /// Delete events created before `cutoff`. Returns how many were removed.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let mut result = self
            .db
            .query("DELETE webhook_event WHERE created_at < $cutoff RETURN BEFORE")
            .bind(("cutoff", to_micros(cutoff)))
            .await?;

        let rows: Vec<WebhookRow> = result.take(0)?;
        Ok(rows.len())
    }
}
