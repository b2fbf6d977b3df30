//! Webhook delivery for job lifecycle events and health alerts.
//!
//! Events are written to the `webhook_event` outbox first and delivered by
//! a background ticker, so a crash between completion and delivery loses
//! nothing. Delivery is at-least-once: receivers should deduplicate on the
//! `X-Webhook-Delivery` header.

mod config;
mod dispatcher;
mod error;
mod payload;
mod targets;

pub use config::{DEFAULT_MAX_ATTEMPTS, WebhookConfig, backoff_delay};
pub use dispatcher::{DELIVERY_HEADER, EVENT_HEADER, ProcessSummary, WebhookDispatcher};
pub use error::WebhookError;
pub use payload::{BACKLOG_ALERT_THRESHOLD, alert_body, backlog_severity, job_event_body};
pub use targets::{resolve_targets, validate_url};
