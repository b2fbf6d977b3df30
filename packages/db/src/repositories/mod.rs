//! Repository implementations for database operations.

mod job_repo;
mod lease_repo;
mod queue_repo;
mod webhook_repo;
mod worker_repo;

pub use job_repo::JobRepository;
pub use lease_repo::LeaseRepository;
pub use queue_repo::{QueueEntryRecord, QueueRepository};
pub use webhook_repo::WebhookRepository;
pub use worker_repo::WorkerRepository;

use serde::Deserialize;

/// Row shape of `SELECT count() AS count ... GROUP ALL`.
#[derive(Deserialize)]
pub(crate) struct CountRow {
    pub count: i64,
}

/// Row shape of grouped status counts.
#[derive(Deserialize)]
pub(crate) struct StatusCount {
    pub status: Option<String>,
    pub count: i64,
}

pub(crate) fn status_map(rows: Vec<StatusCount>) -> std::collections::HashMap<String, u64> {
    let mut map = std::collections::HashMap::new();
    for row in rows {
        if let Some(status) = row.status {
            map.insert(status, row.count.max(0) as u64);
        }
    }
    map
}
