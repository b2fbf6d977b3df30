//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// Idempotent: every statement uses `IF NOT EXISTS`, so each worker process
/// runs it on connect.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(QUEUE_ENTRY_SCHEMA).await?.check()?;
    db.query(LEASE_SCHEMA).await?.check()?;
    db.query(WORKER_SCHEMA).await?.check()?;
    db.query(WEBHOOK_EVENT_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Payloads and results are opaque JSON, so the table stays schemaless.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_finished ON job FIELDS status, finished_at;
"#;

/// Queue membership: one row per job currently waiting in a backlog.
const QUEUE_ENTRY_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue_entry SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON queue_entry TYPE string;
DEFINE FIELD IF NOT EXISTS priority ON queue_entry TYPE int DEFAULT 100;
DEFINE FIELD IF NOT EXISTS queued_at ON queue_entry TYPE int;

DEFINE INDEX IF NOT EXISTS queue_entry_job ON queue_entry FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS queue_entry_order ON queue_entry FIELDS priority, queued_at;
"#;

/// Lease table. The unique job index is the cross-process lock.
const LEASE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS lease SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON lease TYPE string;
DEFINE FIELD IF NOT EXISTS worker_id ON lease TYPE string;
DEFINE FIELD IF NOT EXISTS leased_at ON lease TYPE int;
DEFINE FIELD IF NOT EXISTS expires_at ON lease TYPE int;
DEFINE FIELD IF NOT EXISTS token ON lease TYPE string;
DEFINE FIELD IF NOT EXISTS renewed_count ON lease TYPE int DEFAULT 0;

DEFINE INDEX IF NOT EXISTS lease_job ON lease FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS lease_worker ON lease FIELDS worker_id;
DEFINE INDEX IF NOT EXISTS lease_expiry ON lease FIELDS expires_at;
"#;

/// Worker registrations refreshed by heartbeats.
const WORKER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS worker SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS worker_id ON worker TYPE string;
DEFINE FIELD IF NOT EXISTS hostname ON worker TYPE string;
DEFINE FIELD IF NOT EXISTS capabilities ON worker TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS max_concurrent ON worker TYPE int;
DEFINE FIELD IF NOT EXISTS active_jobs ON worker TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS status ON worker TYPE string DEFAULT "starting";
DEFINE FIELD IF NOT EXISTS last_heartbeat ON worker TYPE int;
DEFINE FIELD IF NOT EXISTS created_at ON worker TYPE int;
DEFINE FIELD IF NOT EXISTS updated_at ON worker TYPE int;

DEFINE INDEX IF NOT EXISTS worker_status ON worker FIELDS status;
DEFINE INDEX IF NOT EXISTS worker_heartbeat ON worker FIELDS last_heartbeat;
"#;

/// Webhook outbox.
const WEBHOOK_EVENT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS webhook_event SCHEMALESS;

DEFINE INDEX IF NOT EXISTS webhook_event_id ON webhook_event FIELDS event_id UNIQUE;
DEFINE INDEX IF NOT EXISTS webhook_event_pending ON webhook_event FIELDS status, created_at;
DEFINE INDEX IF NOT EXISTS webhook_event_job ON webhook_event FIELDS job_id;
"#;
