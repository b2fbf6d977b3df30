//! SurrealDB integration for the render job coordination layer.
//!
//! This crate provides the shared store every worker process talks to:
//! job records, queue membership, leases, worker registrations and the
//! webhook outbox.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect_db, from_micros, to_micros};
pub use schema::init_schema;

use repositories::{
    JobRepository, LeaseRepository, QueueRepository, WebhookRepository, WorkerRepository,
};

/// All repositories over one shared connection.
#[derive(Clone)]
pub struct Store {
    pub db: Database,
    pub jobs: JobRepository,
    pub queue: QueueRepository,
    pub leases: LeaseRepository,
    pub workers: WorkerRepository,
    pub webhooks: WebhookRepository,
}

impl Store {
    /// Wrap an open connection.
    pub fn new(db: Database) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            queue: QueueRepository::new(db.clone()),
            leases: LeaseRepository::new(db.clone()),
            workers: WorkerRepository::new(db.clone()),
            webhooks: WebhookRepository::new(db.clone()),
            db,
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// Connect with the given configuration and build the repositories.
///
/// This should be called once at process startup; clone the result freely.
pub async fn open(config: DbConfig) -> Result<Store, DbError> {
    let db = connect_db(&config).await?;
    Ok(Store::new(db))
}
