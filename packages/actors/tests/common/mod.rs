#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{ExecutionFuture, FnExecutor, JobExecutor};
use chrono::Utc;
use db::{DbConfig, DbError, Store};
use render_core::{Job, JobId, JobResult};
use serde_json::json;
use tokio::sync::Semaphore;

pub async fn store() -> Result<Store, DbError> {
    db::open(DbConfig::memory()).await
}

pub fn job(symbol: &str) -> Job {
    Job::new(symbol, "1h", json!({}))
}

/// A job the recording executor blocks on until [`Recorder::release`].
pub fn held_job(symbol: &str) -> Job {
    Job::new(symbol, "1h", json!({ "hold": true }))
}

/// A job already persisted as queued, as another worker would leave it.
pub fn stored_queued_job(symbol: &str, priority: i32) -> Job {
    let mut job = held_job(symbol);
    job.mark_queued(priority, Utc::now());
    job
}

/// Executor that records start order and obeys payload flags:
/// `hold` waits for a permit, `sleep_ms` sleeps, `panic` panics.
pub struct Recorder {
    started: Mutex<Vec<JobId>>,
    permits: Semaphore,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(Vec::new()),
            permits: Semaphore::new(0),
        })
    }

    pub fn started(&self) -> Vec<JobId> {
        self.started.lock().unwrap().clone()
    }

    /// Let `n` held jobs finish.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub fn executor(self: &Arc<Self>) -> Arc<dyn JobExecutor> {
        let recorder = self.clone();
        Arc::new(FnExecutor::new(move |job: Job| -> ExecutionFuture {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.started.lock().unwrap().push(job.id);

                if job.payload["panic"].as_bool() == Some(true) {
                    panic!("renderer crashed");
                }
                if let Some(ms) = job.payload["sleep_ms"].as_u64() {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                if job.payload["hold"].as_bool() == Some(true) {
                    let permit = recorder.permits.acquire().await.unwrap();
                    permit.forget();
                }
                Ok(JobResult::new(format!("rendered {}", job.symbol)))
            })
        }))
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
