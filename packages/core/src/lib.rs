//! Core domain types for the render job coordination layer.
//!
//! This crate contains shared types used across all packages:
//! - Job and JobStatus for render work items
//! - Lease and WorkerRecord for cross-process coordination
//! - WebhookEvent for the delivery outbox
//! - NotificationEvent for real-time observers

mod events;
mod job;
mod lease;
mod queue;
mod webhook;
mod worker;

pub use events::{JobEventKind, JobSnapshot, NotificationEvent};
pub use job::{DEFAULT_PRIORITY, Job, JobId, JobResult, JobStatus};
pub use lease::Lease;
pub use queue::{DistributedStats, QueuePosition, QueueStats, QueueStatus};
pub use webhook::{
    AlertSeverity, DeliveryStatus, WebhookEvent, WebhookEventId, WebhookEventType,
};
pub use worker::{WorkerRecord, WorkerStatus};
