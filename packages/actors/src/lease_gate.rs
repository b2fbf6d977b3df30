//! Lease-backed dispatch gate and the renewal task that keeps a lease alive.

use std::collections::HashSet;
use std::time::Duration;

use db::Store;
use render_core::{JobId, Lease};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gate::{Claim, ClaimHold, DispatchGate, GateFuture, Selection};
use crate::worker_registry::WorkerRegistry;

/// Share of the TTL between renewals.
const RENEW_FRACTION: f64 = 0.4;

/// Lets a backlog entry start only once this worker holds its lease.
pub(crate) struct LeaseGate {
    registry: WorkerRegistry,
    store: Store,
}

impl LeaseGate {
    pub(crate) fn new(registry: WorkerRegistry, store: Store) -> Self {
        Self { registry, store }
    }

    async fn choose(&self, candidates: Vec<JobId>) -> Selection {
        let mut selection = Selection::default();
        if !self.registry.can_accept_jobs() {
            return selection;
        }

        let live: HashSet<JobId> = match self.registry.live_leased_jobs().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(worker_id = %self.registry.worker_id(), "Failed to read live leases: {}", e);
                return selection;
            }
        };

        let ttl = self.registry.config().lease_ttl;
        for job_id in candidates {
            if live.contains(&job_id) {
                tracing::debug!(job_id = %job_id, "Job is leased by another worker");
                selection.evicted.push(job_id);
                continue;
            }

            let lease = match self.registry.acquire_job_lease(job_id, ttl).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tracing::info!(job_id = %job_id, worker_id = %self.registry.worker_id(), "Lost lease race");
                    selection.evicted.push(job_id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, "Failed to acquire lease: {}", e);
                    return selection;
                }
            };

            match self.store.jobs.find(job_id).await {
                Ok(Some(job)) if job.status.is_terminal() => {
                    tracing::info!(job_id = %job_id, status = %job.status, "Job already finished elsewhere");
                    self.release(job_id).await;
                    selection.evicted.push(job_id);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, "Failed to read job after leasing: {}", e);
                    self.release(job_id).await;
                    return selection;
                }
            }

            self.registry.begin_job();
            let guard = LeaseGuard::start(self.registry.clone(), lease, ttl);
            selection.claim = Some(Claim {
                job_id,
                hold: Some(Box::new(guard)),
            });
            return selection;
        }

        selection
    }

    async fn release(&self, job_id: JobId) {
        if let Err(e) = self.registry.release_job_lease(job_id).await {
            tracing::warn!(job_id = %job_id, "Failed to release lease: {}", e);
        }
    }
}

impl DispatchGate for LeaseGate {
    fn select(&self, candidates: Vec<JobId>) -> GateFuture<'_, Selection> {
        Box::pin(self.choose(candidates))
    }
}

/// Holds a job's lease for the length of one run and keeps renewing it.
pub(crate) struct LeaseGuard {
    job_id: JobId,
    registry: WorkerRegistry,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseGuard {
    pub(crate) fn start(registry: WorkerRegistry, lease: Lease, ttl: Duration) -> Self {
        let cancel = CancellationToken::new();
        let period = ttl.mul_f64(RENEW_FRACTION).max(Duration::from_millis(10));
        let task = tokio::spawn(renew_loop(
            registry.clone(),
            lease.job_id,
            ttl,
            period,
            cancel.clone(),
        ));

        Self {
            job_id: lease.job_id,
            registry,
            cancel,
            task,
        }
    }
}

async fn renew_loop(
    registry: WorkerRegistry,
    job_id: JobId,
    ttl: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match registry.renew_job_lease(job_id, ttl).await {
                    Ok(Some(lease)) => {
                        tracing::debug!(job_id = %job_id, renewed = lease.renewed_count, "Lease renewed");
                    }
                    Ok(None) => {
                        // The job keeps running; another worker may run it too.
                        tracing::warn!(job_id = %job_id, "Lease lost, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, "Lease renewal failed, stopping renewal: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

impl ClaimHold for LeaseGuard {
    fn release(self: Box<Self>) -> GateFuture<'static, ()> {
        let this = *self;
        Box::pin(async move {
            this.cancel.cancel();
            let _ = this.task.await;

            match this.registry.release_job_lease(this.job_id).await {
                Ok(true) => tracing::debug!(job_id = %this.job_id, "Lease released"),
                Ok(false) => tracing::debug!(job_id = %this.job_id, "Lease was already gone"),
                Err(e) => tracing::warn!(job_id = %this.job_id, "Failed to release lease: {}", e),
            }
            this.registry.end_job();
        })
    }
}
