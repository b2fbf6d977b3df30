//! Outbox-backed webhook delivery.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use db::repositories::WebhookRepository;
use futures_util::future::join_all;
use render_core::{AlertSeverity, DeliveryStatus, Job, WebhookEvent, WebhookEventType};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{WebhookConfig, backoff_delay};
use crate::payload::{alert_body, job_event_body};
use crate::targets::{resolve_targets, validate_url};
use crate::WebhookError;

/// Header naming the event type.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the event ID, stable across retries.
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// What one outbox scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Another scan was already running, nothing was done.
    pub skipped: bool,
    pub attempted: usize,
    pub delivered: usize,
    /// Events that reached the retry ceiling on this scan.
    pub exhausted: usize,
}

struct Inner {
    repo: WebhookRepository,
    client: reqwest::Client,
    config: WebhookConfig,
    processing: Mutex<()>,
    cancel: CancellationToken,
}

/// Persists webhook events and delivers them with capped exponential backoff.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    pub fn new(repo: WebhookRepository, config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("render-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                repo,
                client,
                config,
                processing: Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.inner.config
    }

    /// Record one outbox event per configured target of the job.
    pub async fn trigger_webhooks(
        &self,
        job: &Job,
        event_type: WebhookEventType,
    ) -> Result<Vec<WebhookEvent>, WebhookError> {
        let targets = resolve_targets(job);
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let body = job_event_body(job, event_type, Utc::now());
        let mut events = Vec::with_capacity(targets.len());
        for target in targets {
            let event = WebhookEvent::new(Some(job.id), event_type, target, body.clone());
            events.push(self.inner.repo.insert(&event).await?);
        }

        tracing::info!(
            job_id = %job.id,
            event = %event_type,
            count = events.len(),
            "Queued webhook events"
        );
        Ok(events)
    }

    /// Record a health alert for every configured alert target.
    pub async fn trigger_health_alert(
        &self,
        alert_type: WebhookEventType,
        severity: AlertSeverity,
        message: &str,
        data: serde_json::Value,
    ) -> Result<Vec<WebhookEvent>, WebhookError> {
        tracing::warn!(alert = %alert_type, ?severity, "{}", message);

        let body = alert_body(alert_type, severity, message, data, Utc::now());
        let mut events = Vec::new();
        for target in &self.inner.config.alert_urls {
            if let Err(e) = validate_url(target) {
                tracing::warn!("Ignoring alert target: {}", e);
                continue;
            }
            let event = WebhookEvent::new(None, alert_type, target.clone(), body.clone());
            events.push(self.inner.repo.insert(&event).await?);
        }
        Ok(events)
    }

    /// Deliver a batch of pending events.
    ///
    /// Returns immediately with `skipped` set if another scan holds the lock.
    pub async fn process_pending_webhooks(&self) -> Result<ProcessSummary, WebhookError> {
        let Ok(_guard) = self.inner.processing.try_lock() else {
            tracing::debug!("Webhook scan already running, skipping");
            return Ok(ProcessSummary {
                skipped: true,
                ..Default::default()
            });
        };

        let config = &self.inner.config;
        let pending = self
            .inner
            .repo
            .pending(config.max_attempts, config.batch_size)
            .await?;

        let mut summary = ProcessSummary::default();
        for chunk in pending.chunks(config.parallelism.max(1)) {
            let results = join_all(chunk.iter().cloned().map(|event| self.deliver(event))).await;
            for result in results {
                summary.attempted += 1;
                match result {
                    Ok(DeliveryStatus::Delivered) => summary.delivered += 1,
                    Ok(DeliveryStatus::Failed) => summary.exhausted += 1,
                    Ok(DeliveryStatus::Pending) => {}
                    Err(e) => tracing::warn!("Failed to record webhook attempt: {}", e),
                }
            }
        }

        if summary.attempted > 0 {
            tracing::debug!(
                attempted = summary.attempted,
                delivered = summary.delivered,
                exhausted = summary.exhausted,
                "Processed webhook batch"
            );
        }
        Ok(summary)
    }

    /// One delivery attempt for one event, persisted afterwards.
    async fn deliver(&self, mut event: WebhookEvent) -> Result<DeliveryStatus, WebhookError> {
        let config = &self.inner.config;
        event.attempts += 1;

        let delay = backoff_delay(event.attempts, config.base_delay, config.max_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let now = Utc::now();
        event.last_attempt_at = Some(now);

        let response = self
            .inner
            .client
            .post(&event.target_url)
            .header(EVENT_HEADER, event.event_type.as_str())
            .header(DELIVERY_HEADER, event.id.to_string())
            .json(&event.payload)
            .send()
            .await;

        let outcome = match response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("HTTP {}", resp.status())),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                event.status = DeliveryStatus::Delivered;
                event.delivered_at = Some(Utc::now());
                event.error = None;
                tracing::info!(
                    event_id = %event.id,
                    event = %event.event_type,
                    attempts = event.attempts,
                    "Webhook delivered"
                );
            }
            Err(error) => {
                if event.attempts >= config.max_attempts {
                    event.status = DeliveryStatus::Failed;
                    tracing::warn!(
                        event_id = %event.id,
                        url = %event.target_url,
                        attempts = event.attempts,
                        "Webhook gave up: {}",
                        error
                    );
                } else {
                    tracing::warn!(
                        event_id = %event.id,
                        url = %event.target_url,
                        attempts = event.attempts,
                        "Webhook attempt failed: {}",
                        error
                    );
                }
                event.error = Some(error);
            }
        }

        self.inner.repo.save(&event).await?;
        Ok(event.status)
    }

    /// Delete events older than `days`, whatever their state. A horizon
    /// beyond the representable range deletes nothing.
    pub async fn cleanup_old_events(&self, days: i64) -> Result<usize, WebhookError> {
        let cutoff = ChronoDuration::try_days(days)
            .and_then(|horizon| Utc::now().checked_sub_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.inner.repo.delete_older_than(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, days, "Cleaned up old webhook events");
        }
        Ok(removed)
    }

    /// Start the delivery ticker and the hourly cleanup task.
    pub fn start(&self) {
        let dispatcher = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.process_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = dispatcher.process_pending_webhooks().await {
                            tracing::warn!("Webhook scan failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Webhook delivery task stopped");
        });

        let dispatcher = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.cleanup_interval;
        let days = self.inner.config.retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = dispatcher.cleanup_old_events(days).await {
                            tracing::warn!("Webhook cleanup failed: {}", e);
                        }
                    }
                }
            }
        });

        tracing::info!("Webhook dispatcher started");
    }

    /// Stop the background tasks. A delivery already in flight finishes.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
