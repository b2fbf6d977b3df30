//! Observer handles returned by [`NotificationBus::connect`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use render_core::{JobId, NotificationEvent};
use tokio::sync::mpsc;

use crate::bus::NotificationBus;

/// Identifier the bus assigns to each connected observer.
pub type ObserverId = u64;

/// What an observer receives on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverMessage {
    Event(NotificationEvent),
    /// Liveness ping; answer with [`ObserverHandle::pong`] before the next one.
    Ping,
}

/// Which job updates an observer wants.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscriptions {
    pub all: bool,
    pub jobs: HashSet<JobId>,
}

impl Subscriptions {
    pub fn matches(&self, job_id: JobId) -> bool {
        self.all || self.jobs.contains(&job_id)
    }
}

/// Bus-side state for one observer.
pub(crate) struct ObserverSlot {
    pub tx: mpsc::Sender<ObserverMessage>,
    pub subscriptions: Subscriptions,
    pub alive: Arc<AtomicBool>,
}

/// A connected observer.
///
/// Dropping the handle disconnects it.
pub struct ObserverHandle {
    id: ObserverId,
    bus: NotificationBus,
    rx: mpsc::Receiver<ObserverMessage>,
    alive: Arc<AtomicBool>,
}

impl ObserverHandle {
    pub(crate) fn new(
        id: ObserverId,
        bus: NotificationBus,
        rx: mpsc::Receiver<ObserverMessage>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self { id, bus, rx, alive }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Wait for the next message. `None` once the bus dropped this observer.
    pub async fn recv(&mut self) -> Option<ObserverMessage> {
        self.rx.recv().await
    }

    /// Take a message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ObserverMessage> {
        self.rx.try_recv().ok()
    }

    /// Answer the last ping.
    pub fn pong(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Receive updates for one job.
    pub fn subscribe(&self, job_id: JobId) {
        self.bus.update_subscriptions(self.id, |subs| {
            subs.jobs.insert(job_id);
        });
    }

    pub fn unsubscribe(&self, job_id: JobId) {
        self.bus.update_subscriptions(self.id, |subs| {
            subs.jobs.remove(&job_id);
        });
    }

    /// Receive updates for every job.
    pub fn subscribe_all(&self) {
        self.bus.update_subscriptions(self.id, |subs| subs.all = true);
    }

    pub fn unsubscribe_all(&self) {
        self.bus.update_subscriptions(self.id, |subs| {
            subs.all = false;
            subs.jobs.clear();
        });
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.bus.disconnect(self.id);
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle").field("id", &self.id).finish()
    }
}
