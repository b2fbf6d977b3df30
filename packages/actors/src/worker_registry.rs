//! Worker registration, heartbeats, stale-worker reaping and lease calls.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use db::{DbError, Store};
use rand::Rng;
use render_core::{
    AlertSeverity, JobId, Lease, WebhookEventType, WorkerRecord, WorkerStatus,
};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use webhooks::WebhookDispatcher;

/// Registry settings for one worker process.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub worker_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub max_concurrent: usize,
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before another worker reaps this one.
    pub stale_after_intervals: u32,
    pub lease_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Ulid::new()),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            capabilities: Vec::new(),
            max_concurrent: 2,
            heartbeat_interval: Duration::from_secs(10),
            stale_after_intervals: 3,
            lease_ttl: Duration::from_secs(300),
        }
    }
}

impl RegistryConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stale_after_intervals(mut self, intervals: u32) -> Self {
        self.stale_after_intervals = intervals.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Heartbeat age after which a worker counts as dead.
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval
            .checked_mul(self.stale_after_intervals)
            .unwrap_or(Duration::MAX)
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

/// `at + duration`, saturating at the last representable instant.
pub(crate) fn later_by(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, saturating at the first representable instant.
pub(crate) fn earlier_by(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug)]
struct LocalState {
    status: WorkerStatus,
    active_jobs: usize,
    created_at: DateTime<Utc>,
}

struct RegistryInner {
    config: RegistryConfig,
    store: Store,
    state: Mutex<LocalState>,
    cancel: CancellationToken,
    webhooks: Option<WebhookDispatcher>,
}

/// This process's entry in the shared worker table.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new(store: Store, config: RegistryConfig) -> Self {
        Self::build(store, config, None)
    }

    /// Raise `worker.offline` alerts through `webhooks` when reaping.
    pub fn with_webhooks(store: Store, config: RegistryConfig, webhooks: WebhookDispatcher) -> Self {
        Self::build(store, config, Some(webhooks))
    }

    fn build(store: Store, config: RegistryConfig, webhooks: Option<WebhookDispatcher>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                state: Mutex::new(LocalState {
                    status: WorkerStatus::Starting,
                    active_jobs: 0,
                    created_at: Utc::now(),
                }),
                cancel: CancellationToken::new(),
                webhooks,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn status(&self) -> WorkerStatus {
        self.state().status
    }

    pub fn active_jobs(&self) -> usize {
        self.state().active_jobs
    }

    /// Snapshot of this worker's registration.
    pub fn record(&self) -> WorkerRecord {
        let state = self.state();
        let now = Utc::now();
        let config = &self.inner.config;
        WorkerRecord {
            id: config.worker_id.clone(),
            hostname: config.hostname.clone(),
            capabilities: config.capabilities.clone(),
            max_concurrent: config.max_concurrent,
            active_jobs: state.active_jobs,
            status: state.status,
            last_heartbeat: now,
            created_at: state.created_at,
            updated_at: now,
        }
    }

    /// Register as active, start heartbeating and reap stale peers.
    pub async fn start(&self) -> Result<(), DbError> {
        self.state().status = WorkerStatus::Active;
        self.inner.store.workers.upsert(&self.record()).await?;
        tracing::info!(
            worker_id = %self.worker_id(),
            hostname = %self.inner.config.hostname,
            max_concurrent = self.inner.config.max_concurrent,
            "Worker registered"
        );

        self.spawn_heartbeat();

        if let Err(e) = self.cleanup_stale_workers().await {
            tracing::warn!(worker_id = %self.worker_id(), "Stale worker sweep failed: {}", e);
        }
        Ok(())
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.inner.config.heartbeat_interval;
        let spread = (base.as_millis() / 10) as u64;
        if spread == 0 {
            return base;
        }
        base.saturating_add(Duration::from_millis(rand::rng().random_range(0..=spread)))
    }

    fn spawn_heartbeat(&self) {
        let registry = self.clone();
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            loop {
                let delay = registry.jittered_interval();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(e) = registry.heartbeat().await {
                    tracing::warn!(worker_id = %registry.worker_id(), "Heartbeat failed: {}", e);
                }
            }
            tracing::debug!(worker_id = %registry.worker_id(), "Heartbeat task stopped");
        });
    }

    /// Refresh this worker's liveness, load and status.
    pub async fn heartbeat(&self) -> Result<(), DbError> {
        let (status, active_jobs) = {
            let mut state = self.state();
            if matches!(state.status, WorkerStatus::Active | WorkerStatus::Idle | WorkerStatus::Starting) {
                state.status = if state.active_jobs > 0 {
                    WorkerStatus::Active
                } else {
                    WorkerStatus::Idle
                };
            }
            (state.status, state.active_jobs)
        };

        let updated = self
            .inner
            .store
            .workers
            .heartbeat(self.worker_id(), active_jobs, status, Utc::now())
            .await?;

        if updated.is_none() && status != WorkerStatus::Stopped {
            // Another worker reaped us during a stall; our leases are gone,
            // so register again and keep serving.
            tracing::warn!(worker_id = %self.worker_id(), "Worker was marked stopped, registering again");
            self.inner.store.workers.upsert(&self.record()).await?;
        }
        Ok(())
    }

    /// Stop every worker whose heartbeat is older than the stale threshold,
    /// release its leases and put its in-progress jobs back in the queue.
    pub async fn cleanup_stale_workers(&self) -> Result<Vec<WorkerRecord>, DbError> {
        let now = Utc::now();
        let cutoff = earlier_by(now, self.inner.config.stale_threshold());
        let stale = self
            .inner
            .store
            .workers
            .mark_stale_stopped(cutoff, now, self.worker_id())
            .await?;

        for worker in &stale {
            match self.reclaim(worker, now).await {
                Ok((released, requeued)) => {
                    tracing::warn!(
                        worker_id = %worker.id,
                        released,
                        requeued,
                        "Reaped stale worker"
                    );
                    self.alert_offline(worker, released, requeued).await;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker.id, "Failed to reclaim leases of stale worker: {}", e);
                }
            }
        }
        Ok(stale)
    }

    async fn reclaim(&self, worker: &WorkerRecord, now: DateTime<Utc>) -> Result<(usize, usize), DbError> {
        let store = &self.inner.store;
        let leases = store.leases.release_all(&worker.id).await?;

        let mut requeued = 0;
        for lease in &leases {
            if let Some(job) = store.jobs.requeue(lease.job_id, now).await? {
                store
                    .queue
                    .upsert(job.id, job.priority, job.queued_at.unwrap_or(now))
                    .await?;
                requeued += 1;
            }
        }
        Ok((leases.len(), requeued))
    }

    async fn alert_offline(&self, worker: &WorkerRecord, released: usize, requeued: usize) {
        let Some(webhooks) = &self.inner.webhooks else {
            return;
        };
        let data = serde_json::json!({
            "worker_id": worker.id,
            "hostname": worker.hostname,
            "last_heartbeat": worker.last_heartbeat,
            "released_leases": released,
            "requeued_jobs": requeued,
        });
        let message = format!("Worker {} stopped sending heartbeats", worker.id);
        if let Err(e) = webhooks
            .trigger_health_alert(WebhookEventType::WorkerOffline, AlertSeverity::High, &message, data)
            .await
        {
            tracing::warn!(worker_id = %worker.id, "Failed to queue offline alert: {}", e);
        }
    }

    /// Take the lease on a job for `ttl`. `None` means another worker holds it.
    pub async fn acquire_job_lease(&self, job_id: JobId, ttl: Duration) -> Result<Option<Lease>, DbError> {
        let now = Utc::now();
        self.inner
            .store
            .leases
            .acquire(job_id, self.worker_id(), now, later_by(now, ttl))
            .await
    }

    /// Push this worker's lease out to now + `extension`.
    pub async fn renew_job_lease(&self, job_id: JobId, extension: Duration) -> Result<Option<Lease>, DbError> {
        let expires_at = later_by(Utc::now(), extension);
        self.inner
            .store
            .leases
            .renew(job_id, self.worker_id(), expires_at)
            .await
    }

    pub async fn release_job_lease(&self, job_id: JobId) -> Result<bool, DbError> {
        self.inner.store.leases.release(job_id, self.worker_id()).await
    }

    /// Job ids with an unexpired lease held by any worker.
    pub async fn live_leased_jobs(&self) -> Result<Vec<JobId>, DbError> {
        self.inner.store.leases.live_job_ids(Utc::now()).await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, DbError> {
        self.inner.store.workers.list().await
    }

    /// Whether this worker may take another job right now.
    pub fn can_accept_jobs(&self) -> bool {
        let state = self.state();
        state.status.admits_jobs() && state.active_jobs < self.inner.config.max_concurrent
    }

    /// Count a job as running here.
    pub fn begin_job(&self) {
        let mut state = self.state();
        state.active_jobs += 1;
        if state.status.admits_jobs() {
            state.status = WorkerStatus::Active;
        }
    }

    pub fn end_job(&self) {
        let mut state = self.state();
        state.active_jobs = state.active_jobs.saturating_sub(1);
        if state.status.admits_jobs() && state.active_jobs == 0 {
            state.status = WorkerStatus::Idle;
        }
    }

    /// Refuse new jobs from now on and tell the other workers.
    pub async fn drain(&self) -> Result<(), DbError> {
        {
            let mut state = self.state();
            if state.status == WorkerStatus::Stopped {
                return Ok(());
            }
            state.status = WorkerStatus::Draining;
        }
        tracing::info!(worker_id = %self.worker_id(), "Worker draining");
        self.inner
            .store
            .workers
            .set_status(self.worker_id(), WorkerStatus::Draining, Utc::now())
            .await
    }

    /// Stop heartbeating, record `stopped` and give up every lease held here.
    pub async fn shutdown(&self) -> Result<(), DbError> {
        self.inner.cancel.cancel();
        {
            let mut state = self.state();
            state.status = WorkerStatus::Stopped;
            state.active_jobs = 0;
        }

        self.inner.store.workers.upsert(&self.record()).await?;
        let released = self.inner.store.leases.release_all(self.worker_id()).await?;
        tracing::info!(
            worker_id = %self.worker_id(),
            released = released.len(),
            "Worker stopped"
        );
        Ok(())
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("worker_id", &self.inner.config.worker_id)
            .field("state", &*self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_is_a_multiple_of_the_interval() {
        let config = RegistryConfig::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_stale_after_intervals(3);
        assert_eq!(config.stale_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn huge_durations_saturate_instead_of_panicking() {
        let config = RegistryConfig::default()
            .with_heartbeat_interval(Duration::MAX)
            .with_stale_after_intervals(3);
        assert_eq!(config.stale_threshold(), Duration::MAX);

        let now = Utc::now();
        assert_eq!(later_by(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(earlier_by(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            later_by(now, Duration::from_secs(300)),
            now + ChronoDuration::seconds(300)
        );
    }

    #[test]
    fn default_worker_ids_are_unique() {
        let a = RegistryConfig::default();
        let b = RegistryConfig::default();
        assert!(a.worker_id.starts_with("worker-"));
        assert_ne!(a.worker_id, b.worker_id);
    }
}
