//! The pluggable job executor.

use std::future::Future;
use std::pin::Pin;

use render_core::{Job, JobResult};

/// Result type for job executors.
pub type ExecutionResult = Result<JobResult, String>;

/// Future type for async job executors.
pub type ExecutionFuture = Pin<Box<dyn Future<Output = ExecutionResult> + Send>>;

/// Runs a job's payload.
///
/// The queue owns timeouts and panic capture, so implementations only report
/// success or a failure message. Jobs may run more than once after a worker
/// loss; implementations must be idempotent.
pub trait JobExecutor: Send + Sync + 'static {
    fn execute(&self, job: Job) -> ExecutionFuture;
}

/// A closure-based executor.
pub struct FnExecutor<F>
where
    F: Fn(Job) -> ExecutionFuture + Send + Sync + 'static,
{
    executor: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(Job) -> ExecutionFuture + Send + Sync + 'static,
{
    pub fn new(executor: F) -> Self {
        Self { executor }
    }
}

impl<F> JobExecutor for FnExecutor<F>
where
    F: Fn(Job) -> ExecutionFuture + Send + Sync + 'static,
{
    fn execute(&self, job: Job) -> ExecutionFuture {
        (self.executor)(job)
    }
}

/// Build an [`FnExecutor`] from an async body.
///
/// ```ignore
/// let executor = job_executor!(|job| {
///     Ok(JobResult::new(format!("rendered {}", job.symbol)))
/// });
/// ```
#[macro_export]
macro_rules! job_executor {
    (|$job:ident| $body:expr) => {
        $crate::FnExecutor::new(
            |$job: $crate::render_core::Job| -> $crate::ExecutionFuture {
                Box::pin(async move { $body })
            },
        )
    };
}
