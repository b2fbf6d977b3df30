//! Real-time notification bus for job lifecycle events.
//!
//! Observers connect to a [`NotificationBus`], subscribe to individual jobs
//! or to everything, and receive [`render_core::NotificationEvent`]s on a
//! bounded channel. A liveness task pings observers and drops those that
//! stop answering.

mod bus;
mod observer;

pub use bus::{BusConfig, NotificationBus, job_progress};
pub use observer::{ObserverHandle, ObserverId, ObserverMessage};
