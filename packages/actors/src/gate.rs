//! Dispatch gates decide which backlog entry may start.

use std::future::Future;
use std::pin::Pin;

use render_core::JobId;

/// Boxed future returned by gate operations.
pub type GateFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something held for the duration of a job run, such as a lease.
///
/// Released exactly once after the job's terminal state is persisted.
pub trait ClaimHold: Send + 'static {
    fn release(self: Box<Self>) -> GateFuture<'static, ()>;
}

/// Permission to start one job.
pub struct Claim {
    pub job_id: JobId,
    pub hold: Option<Box<dyn ClaimHold>>,
}

impl Claim {
    pub fn open(job_id: JobId) -> Self {
        Self { job_id, hold: None }
    }

    /// Give back whatever the claim holds without running the job.
    pub async fn release(self) {
        if let Some(hold) = self.hold {
            hold.release().await;
        }
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("job_id", &self.job_id)
            .field("held", &self.hold.is_some())
            .finish()
    }
}

/// Outcome of one gate decision.
#[derive(Debug, Default)]
pub struct Selection {
    pub claim: Option<Claim>,
    /// Candidates owned elsewhere; the queue drops them from its backlog.
    pub evicted: Vec<JobId>,
}

/// Decides which backlog entry may start.
///
/// `candidates` are in dispatch order. The gate returns at most one claim.
pub trait DispatchGate: Send + Sync + 'static {
    fn select(&self, candidates: Vec<JobId>) -> GateFuture<'_, Selection>;
}

/// Gate for a standalone queue: always claims the first candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl DispatchGate for OpenGate {
    fn select(&self, candidates: Vec<JobId>) -> GateFuture<'_, Selection> {
        Box::pin(async move {
            Selection {
                claim: candidates.first().copied().map(Claim::open),
                evicted: Vec::new(),
            }
        })
    }
}
