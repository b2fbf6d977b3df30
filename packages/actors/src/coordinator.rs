//! Cross-process coordination: a local queue gated by shared leases.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::Store;
use notify::NotificationBus;
use render_core::{
    AlertSeverity, DistributedStats, Job, JobId, JobStatus, QueueStatus, WebhookEventType,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webhooks::{BACKLOG_ALERT_THRESHOLD, WebhookDispatcher, backlog_severity};

use crate::error::{CoordinatorError, QueueError};
use crate::executor::JobExecutor;
use crate::lease_gate::LeaseGate;
use crate::mirror::StoreMirror;
use crate::queue_actor::{PriorityQueue, QueueActorState, QueueConfig};
use crate::worker_registry::{RegistryConfig, WorkerRegistry, earlier_by};

/// Orphan count at which the alert is raised as high severity.
const ORPHAN_HIGH_SEVERITY: usize = 10;

/// Local backlog, in multiples of `max_concurrent`, that counts as overload.
const OVERLOAD_FACTOR: usize = 5;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queue: QueueConfig,
    pub registry: RegistryConfig,
    pub recovery_enabled: bool,
    /// Delay before the first recovery cycle.
    pub recovery_warmup: Duration,
    pub recovery_interval: Duration,
    /// Finished jobs older than this are deleted from the store.
    pub job_retention: Duration,
    /// How long shutdown waits for running jobs.
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            registry: RegistryConfig::default(),
            recovery_enabled: true,
            recovery_warmup: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(30),
            job_retention: Duration::from_secs(24 * 3600),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.registry = self.registry.with_worker_id(worker_id);
        self
    }

    /// Sets the cap for both the local queue and the worker registration.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.queue = self.queue.with_max_concurrent(max_concurrent);
        self.registry = self.registry.with_max_concurrent(max_concurrent);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.registry = self.registry.with_lease_ttl(ttl);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.registry = self.registry.with_heartbeat_interval(interval);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.queue = self.queue.with_job_timeout(timeout);
        self
    }

    pub fn with_recovery(mut self, warmup: Duration, interval: Duration) -> Self {
        self.recovery_enabled = true;
        self.recovery_warmup = warmup;
        self.recovery_interval = interval;
        self
    }

    /// Only run recovery when [`DistributedCoordinator::recover_orphans`] is called.
    pub fn without_recovery_loop(mut self) -> Self {
        self.recovery_enabled = false;
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self.queue = self.queue.with_finished_retention(retention);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// What one recovery cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reaped_workers: usize,
    pub expired_leases: usize,
    /// Jobs moved from `in_progress` back to `queued`.
    pub requeued: usize,
    /// Store-queued jobs newly tracked by this process.
    pub adopted: usize,
    /// Local backlog entries dropped because another worker leased them.
    pub evicted: usize,
    pub purged: usize,
}

impl RecoveryReport {
    fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

/// Assembles a [`DistributedCoordinator`].
pub struct CoordinatorBuilder {
    store: Store,
    config: CoordinatorConfig,
    executor: Arc<dyn JobExecutor>,
    bus: Option<NotificationBus>,
    webhooks: Option<WebhookDispatcher>,
}

impl CoordinatorBuilder {
    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_webhooks(mut self, webhooks: WebhookDispatcher) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Spawn the queue, register the worker and start recovery.
    pub async fn start(self) -> Result<DistributedCoordinator, CoordinatorError> {
        let CoordinatorBuilder {
            store,
            mut config,
            executor,
            bus,
            webhooks,
        } = self;
        config.registry.max_concurrent = config.queue.max_concurrent;

        let registry = match &webhooks {
            Some(webhooks) => {
                WorkerRegistry::with_webhooks(store.clone(), config.registry.clone(), webhooks.clone())
            }
            None => WorkerRegistry::new(store.clone(), config.registry.clone()),
        };

        let gate = Arc::new(LeaseGate::new(registry.clone(), store.clone()));
        let mut state = QueueActorState::new(config.queue.clone(), executor, StoreMirror::spawn(store.clone()))
            .with_gate(gate);
        if let Some(bus) = &bus {
            state = state.with_bus(bus.clone());
        }
        if let Some(webhooks) = &webhooks {
            state = state.with_webhooks(webhooks.clone());
        }

        let queue = PriorityQueue::spawn(state).await?;
        registry.start().await?;

        let coordinator = DistributedCoordinator {
            inner: Arc::new(CoordinatorInner {
                config,
                store,
                queue,
                registry,
                webhooks,
                cancel: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
                backlog_alerted: AtomicBool::new(false),
                overload_alerted: AtomicBool::new(false),
            }),
        };

        if coordinator.inner.config.recovery_enabled {
            coordinator.spawn_recovery();
        }

        tracing::info!(worker_id = %coordinator.worker_id(), "Coordinator started");
        Ok(coordinator)
    }
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    store: Store,
    queue: PriorityQueue,
    registry: WorkerRegistry,
    webhooks: Option<WebhookDispatcher>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    backlog_alerted: AtomicBool,
    overload_alerted: AtomicBool,
}

/// A worker process's entry point into the shared job system.
///
/// Jobs are admitted to a local [`PriorityQueue`] whose dispatch is gated on
/// winning the job's lease in the shared store. Cheap to clone.
#[derive(Clone)]
pub struct DistributedCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DistributedCoordinator {
    pub fn builder(
        store: Store,
        config: CoordinatorConfig,
        executor: Arc<dyn JobExecutor>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            store,
            config,
            executor,
            bus: None,
            webhooks: None,
        }
    }

    pub fn worker_id(&self) -> &str {
        self.inner.registry.worker_id()
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.inner.queue
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    fn ensure_running(&self) -> Result<(), CoordinatorError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            Err(CoordinatorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Submit a job at its own priority.
    pub async fn enqueue(&self, job: Job) -> Result<Job, CoordinatorError> {
        self.submit(job, None).await
    }

    pub async fn enqueue_with_priority(&self, job: Job, priority: i32) -> Result<Job, CoordinatorError> {
        self.submit(job, Some(priority)).await
    }

    async fn submit(&self, job: Job, priority: Option<i32>) -> Result<Job, CoordinatorError> {
        self.ensure_running()?;
        if let Some(existing) = self.inner.store.jobs.find(job.id).await? {
            if !existing.status.is_terminal() {
                return Err(CoordinatorError::DuplicateJob(job.id));
            }
        }

        let queued = self.inner.queue.enqueue(job, priority).await?;
        // Other workers can only adopt what has reached the store.
        self.inner.queue.flush().await;
        Ok(queued)
    }

    /// Cancel a job that no worker has started yet.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job, CoordinatorError> {
        self.ensure_unleased(job_id).await?;
        Ok(self.inner.queue.cancel_job(job_id).await?)
    }

    pub async fn update_priority(&self, job_id: JobId, priority: i32) -> Result<Job, CoordinatorError> {
        self.ensure_unleased(job_id).await?;
        Ok(self.inner.queue.update_priority(job_id, priority).await?)
    }

    /// Fails with `NotQueued` if any worker holds a live lease on the job.
    /// A local copy of a job leased elsewhere is stale and gets dropped.
    async fn ensure_unleased(&self, job_id: JobId) -> Result<(), CoordinatorError> {
        let Some(lease) = self.inner.store.leases.get(job_id).await? else {
            return Ok(());
        };
        if !lease.is_live(Utc::now()) {
            return Ok(());
        }
        if lease.worker_id != self.worker_id() {
            tracing::info!(job_id = %job_id, worker_id = %lease.worker_id, "Job already leased by another worker");
            self.inner.queue.evict(vec![job_id]).await?;
        }
        Err(QueueError::NotQueued(job_id).into())
    }

    pub async fn get_status(&self) -> Result<QueueStatus, CoordinatorError> {
        Ok(self.inner.queue.get_status().await?)
    }

    /// A job known to this process, or else its stored record.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, CoordinatorError> {
        if let Some(job) = self.inner.queue.get_job(job_id).await? {
            return Ok(Some(job));
        }
        Ok(self.inner.store.jobs.find(job_id).await?)
    }

    pub async fn get_job_position(&self, job_id: JobId) -> Result<Option<usize>, CoordinatorError> {
        Ok(self.inner.queue.get_job_position(job_id).await?)
    }

    pub async fn get_estimated_start_time(
        &self,
        job_id: JobId,
    ) -> Result<Option<DateTime<Utc>>, CoordinatorError> {
        Ok(self.inner.queue.get_estimated_start_time(job_id).await?)
    }

    /// This worker's backlog combined with cluster-wide counts.
    pub async fn get_distributed_stats(&self) -> Result<DistributedStats, CoordinatorError> {
        let local = self.inner.queue.get_status().await?;
        let local_stats = self.inner.queue.get_stats().await?;
        let workers = self.inner.store.workers.count_by_status().await?;
        let jobs = self.inner.store.jobs.count_by_status().await?;
        let live_leases = self.inner.registry.live_leased_jobs().await?.len();

        Ok(DistributedStats {
            worker_id: self.worker_id().to_string(),
            worker_status: self.inner.registry.status(),
            active_jobs: self.inner.registry.active_jobs(),
            max_concurrent: self.inner.config.queue.max_concurrent,
            local,
            local_stats,
            workers,
            live_leases,
            jobs,
        })
    }

    fn spawn_recovery(&self) {
        let coordinator = self.clone();
        let cancel = self.inner.cancel.clone();
        let warmup = self.inner.config.recovery_warmup;
        let period = self.inner.config.recovery_interval;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(warmup) => {}
            }
            loop {
                match coordinator.recover_orphans().await {
                    Ok(report) if report.is_quiet() => {
                        tracing::debug!("Recovery found nothing to do");
                    }
                    Ok(report) => {
                        tracing::info!(
                            reaped = report.reaped_workers,
                            expired = report.expired_leases,
                            requeued = report.requeued,
                            adopted = report.adopted,
                            evicted = report.evicted,
                            purged = report.purged,
                            "Recovery cycle"
                        );
                    }
                    Err(e) => tracing::warn!("Recovery cycle failed: {}", e),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            tracing::debug!("Recovery task stopped");
        });
    }

    /// One recovery cycle: reap dead workers, requeue orphaned jobs, adopt
    /// the shared backlog, raise alerts and purge old finished jobs.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, CoordinatorError> {
        let store = &self.inner.store;
        let mut report = RecoveryReport::default();

        match self.inner.registry.cleanup_stale_workers().await {
            Ok(reaped) => report.reaped_workers = reaped.len(),
            Err(e) => tracing::warn!("Stale worker sweep failed: {}", e),
        }

        let now = Utc::now();
        let expired = store.leases.take_expired(now).await?;
        report.expired_leases = expired.len();
        for lease in &expired {
            tracing::info!(job_id = %lease.job_id, worker_id = %lease.worker_id, "Lease expired");
            if self.requeue(lease.job_id, now).await? {
                report.requeued += 1;
            }
        }

        for job in store.jobs.in_progress_without_lease().await? {
            tracing::info!(job_id = %job.id, "Job in progress without a lease");
            if self.requeue(job.id, now).await? {
                report.requeued += 1;
            }
        }

        if !self.inner.shutting_down.load(Ordering::SeqCst) {
            let queued = store.jobs.list_by_status(JobStatus::Queued).await?;
            report.adopted = self.inner.queue.restore(queued).await?;

            // A full worker never consults its gate; drop copies of jobs leased elsewhere.
            let taken = store.leases.live_held_by_others(self.worker_id(), now).await?;
            report.evicted = self.inner.queue.evict(taken).await?;
        }

        self.raise_alerts(&report).await;

        let cutoff = earlier_by(now, self.inner.config.job_retention);
        let purged = store.jobs.delete_finished_before(cutoff).await?;
        report.purged = purged.len();
        self.inner.queue.forget(purged);

        Ok(report)
    }

    /// `in_progress → queued` in the store. False if someone else got there first.
    async fn requeue(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, CoordinatorError> {
        let store = &self.inner.store;
        let Some(job) = store.jobs.requeue(job_id, now).await? else {
            return Ok(false);
        };
        store
            .queue
            .upsert(job.id, job.priority, job.queued_at.unwrap_or(now))
            .await?;
        tracing::info!(job_id = %job.id, attempts = job.attempts, "Requeued orphaned job");
        Ok(true)
    }

    async fn raise_alerts(&self, report: &RecoveryReport) {
        let Some(webhooks) = &self.inner.webhooks else {
            return;
        };

        if report.requeued > 0 {
            let severity = if report.requeued >= ORPHAN_HIGH_SEVERITY {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            };
            let message = format!("Recovered {} orphaned jobs", report.requeued);
            let data = serde_json::json!({
                "worker_id": self.worker_id(),
                "requeued": report.requeued,
                "expired_leases": report.expired_leases,
            });
            self.alert(webhooks, WebhookEventType::JobsOrphaned, severity, &message, data)
                .await;
        }

        match self.inner.store.queue.count().await {
            Ok(depth) => {
                let depth = depth as usize;
                let over = depth > BACKLOG_ALERT_THRESHOLD;
                if over && !self.inner.backlog_alerted.swap(true, Ordering::SeqCst) {
                    let message = format!("Queue backlog at {} jobs", depth);
                    let data = serde_json::json!({
                        "depth": depth,
                        "threshold": BACKLOG_ALERT_THRESHOLD,
                    });
                    self.alert(webhooks, WebhookEventType::QueueBacklog, backlog_severity(depth), &message, data)
                        .await;
                } else if !over {
                    self.inner.backlog_alerted.store(false, Ordering::SeqCst);
                }
            }
            Err(e) => tracing::warn!("Failed to read backlog depth: {}", e),
        }

        match self.inner.queue.get_status().await {
            Ok(status) => {
                let max = status.max_concurrent.max(1);
                let over = status.in_progress >= max && status.queued >= OVERLOAD_FACTOR * max;
                if over && !self.inner.overload_alerted.swap(true, Ordering::SeqCst) {
                    let message = format!(
                        "Worker {} is saturated with {} jobs waiting",
                        self.worker_id(),
                        status.queued
                    );
                    let data = serde_json::json!({
                        "worker_id": self.worker_id(),
                        "in_progress": status.in_progress,
                        "queued": status.queued,
                        "max_concurrent": status.max_concurrent,
                    });
                    self.alert(webhooks, WebhookEventType::WorkerOverloaded, AlertSeverity::Medium, &message, data)
                        .await;
                } else if !over {
                    self.inner.overload_alerted.store(false, Ordering::SeqCst);
                }
            }
            Err(e) => tracing::warn!("Failed to read queue status: {}", e),
        }
    }

    async fn alert(
        &self,
        webhooks: &WebhookDispatcher,
        alert_type: WebhookEventType,
        severity: AlertSeverity,
        message: &str,
        data: serde_json::Value,
    ) {
        if let Err(e) = webhooks
            .trigger_health_alert(alert_type, severity, message, data)
            .await
        {
            tracing::warn!(alert = %alert_type, "Failed to queue alert: {}", e);
        }
    }

    /// Stop taking new jobs; running jobs finish.
    pub async fn drain(&self) -> Result<(), CoordinatorError> {
        self.inner.registry.drain().await?;
        Ok(())
    }

    /// Drain, wait up to the grace period for running jobs, then release
    /// everything this worker holds. Queued jobs stay in the store for
    /// other workers.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(worker_id = %self.worker_id(), "Coordinator shutting down");
        self.inner.cancel.cancel();

        if let Err(e) = self.inner.registry.drain().await {
            tracing::warn!(worker_id = %self.worker_id(), "Failed to persist draining status: {}", e);
        }
        if let Err(e) = self.inner.queue.stop_dispatch().await {
            tracing::warn!("Failed to stop dispatch: {}", e);
        }

        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        loop {
            match self.inner.queue.get_status().await {
                Ok(status) if status.in_progress == 0 => break,
                Ok(status) if Instant::now() >= deadline => {
                    tracing::warn!(
                        in_progress = status.in_progress,
                        "Grace period over with jobs still running"
                    );
                    break;
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(_) => break,
            }
        }

        self.inner.registry.shutdown().await?;
        self.inner.queue.shutdown().await;
        tracing::info!(worker_id = %self.worker_id(), "Coordinator stopped");
        Ok(())
    }
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("worker_id", &self.worker_id())
            .finish()
    }
}
