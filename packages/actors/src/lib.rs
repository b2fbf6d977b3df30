//! Actor system and coordination for render jobs.
//!
//! This crate provides the Ractor-based local queue and the pieces that let
//! several worker processes share one job store.
//!
//! # Architecture
//!
//! - `QueueActor` - Owns one process's priority backlog and dispatches jobs
//!   to a [`JobExecutor`] with bounded concurrency
//! - `WorkerRegistry` - Registers the worker, heartbeats, reaps dead peers
//!   and wraps lease calls
//! - `DistributedCoordinator` - Gates the queue on leases and recovers
//!   orphaned jobs
//!
//! # Usage
//!
//! ```ignore
//! use actors::{CoordinatorConfig, DistributedCoordinator, job_executor};
//!
//! let executor = Arc::new(job_executor!(|job| {
//!     Ok(JobResult::new(format!("rendered {}", job.symbol)))
//! }));
//! let coordinator = DistributedCoordinator::builder(store, CoordinatorConfig::default(), executor)
//!     .start()
//!     .await?;
//! coordinator.enqueue(job).await?;
//! ```

mod coordinator;
mod error;
mod executor;
mod gate;
mod lease_gate;
mod messages;
mod mirror;
mod queue_actor;
mod worker_registry;

pub use coordinator::{CoordinatorBuilder, CoordinatorConfig, DistributedCoordinator, RecoveryReport};
pub use error::{CoordinatorError, QueueError};
pub use executor::{ExecutionFuture, ExecutionResult, FnExecutor, JobExecutor};
pub use gate::{Claim, ClaimHold, DispatchGate, GateFuture, OpenGate, Selection};
pub use messages::QueueMessage;
pub use mirror::StoreMirror;
pub use queue_actor::{PriorityQueue, QueueActor, QueueActorState, QueueConfig};
pub use worker_registry::{RegistryConfig, WorkerRegistry};

/// Re-exported so `job_executor!` expands in downstream crates.
pub use render_core;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
