//! Publish/subscribe fan-out of job lifecycle events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use render_core::{Job, JobEventKind, JobId, JobSnapshot, JobStatus, NotificationEvent};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::observer::{ObserverHandle, ObserverId, ObserverMessage, ObserverSlot, Subscriptions};

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How often observers are pinged.
    pub ping_interval: Duration,
    /// Per-observer buffer; a full buffer drops messages for that observer.
    pub channel_capacity: usize,
    /// Expected run time used for the in-progress estimate.
    pub expected_job_duration: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            channel_capacity: 256,
            expected_job_duration: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

struct BusInner {
    config: BusConfig,
    observers: Mutex<HashMap<ObserverId, ObserverSlot>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// Fan-out of [`NotificationEvent`]s to connected observers.
///
/// Cheap to clone; clones share the same observer set.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start the liveness task. It runs until [`Self::shutdown`].
    pub fn start(&self) {
        let bus = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.ping_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let dropped = bus.ping_observers();
                        if dropped > 0 {
                            tracing::info!(dropped, "Disconnected unresponsive observers");
                        }
                    }
                }
            }
            tracing::debug!("Notification liveness task stopped");
        });
    }

    fn observers(&self) -> MutexGuard<'_, HashMap<ObserverId, ObserverSlot>> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect a new observer with no subscriptions.
    pub fn connect(&self) -> ObserverHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);
        let alive = Arc::new(AtomicBool::new(true));

        self.observers().insert(
            id,
            ObserverSlot {
                tx,
                subscriptions: Subscriptions::default(),
                alive: alive.clone(),
            },
        );
        tracing::debug!(observer_id = id, "Observer connected");

        ObserverHandle::new(id, self.clone(), rx, alive)
    }

    /// Remove an observer. Its channel closes once buffered messages drain.
    pub fn disconnect(&self, id: ObserverId) {
        if self.observers().remove(&id).is_some() {
            tracing::debug!(observer_id = id, "Observer disconnected");
        }
    }

    pub(crate) fn update_subscriptions(&self, id: ObserverId, f: impl FnOnce(&mut Subscriptions)) {
        if let Some(slot) = self.observers().get_mut(&id) {
            f(&mut slot.subscriptions);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers().len()
    }

    /// Send a job update to observers subscribed to that job or to everything.
    ///
    /// Returns how many observers accepted the message.
    pub fn broadcast_job_update(&self, job: &Job, kind: JobEventKind) -> usize {
        let now = Utc::now();
        let progress = job_progress(job, now, self.inner.config.expected_job_duration);
        let event = NotificationEvent::JobUpdate {
            event_type: kind,
            job: JobSnapshot::from_job(job, progress),
            timestamp: now,
        };
        self.deliver(event, Some(job.id))
    }

    /// Send a full pattern overlay to every observer.
    pub fn broadcast_pattern_overlay(&self, data: serde_json::Value) -> usize {
        self.deliver(
            NotificationEvent::PatternOverlay {
                data,
                timestamp: Utc::now(),
            },
            None,
        )
    }

    /// Send an overlay delta to every observer.
    pub fn broadcast_pattern_delta(&self, data: serde_json::Value) -> usize {
        self.deliver(
            NotificationEvent::PatternDelta {
                data,
                timestamp: Utc::now(),
            },
            None,
        )
    }

    fn deliver(&self, event: NotificationEvent, job_id: Option<JobId>) -> usize {
        let mut observers = self.observers();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, slot) in observers.iter() {
            if let Some(job_id) = job_id
                && !slot.subscriptions.matches(job_id)
            {
                continue;
            }
            match slot.tx.try_send(ObserverMessage::Event(event.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(observer_id = id, "Observer lagging, skipped {}", event.description());
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            observers.remove(&id);
        }
        delivered
    }

    /// One liveness round: drop observers that missed the previous ping and
    /// ping the rest. Returns how many were dropped.
    pub fn ping_observers(&self) -> usize {
        let mut observers = self.observers();
        let before = observers.len();

        observers.retain(|_, slot| {
            if !slot.alive.swap(false, Ordering::AcqRel) {
                return false;
            }
            !matches!(slot.tx.try_send(ObserverMessage::Ping), Err(TrySendError::Closed(_)))
        });

        before - observers.len()
    }

    /// Stop the liveness task and close every observer.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let closed = {
            let mut observers = self.observers();
            let n = observers.len();
            observers.clear();
            n
        };
        tracing::info!(closed, "Notification bus shut down");
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Progress shown to observers: 0 while waiting, 100 when done, -1 on failure,
/// and an elapsed-time estimate capped at 95 while running.
pub fn job_progress(job: &Job, now: DateTime<Utc>, expected: Duration) -> i32 {
    match job.status {
        JobStatus::Pending | JobStatus::Queued => 0,
        JobStatus::Succeeded => 100,
        JobStatus::Failed => -1,
        JobStatus::InProgress => {
            let Some(started_at) = job.started_at else {
                return 0;
            };
            let elapsed = (now - started_at).num_milliseconds().max(0) as f64;
            let expected = expected.as_millis().max(1) as f64;
            ((elapsed / expected) * 100.0).min(95.0) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_by_status() {
        let now = Utc::now();
        let expected = Duration::from_secs(30);
        let mut job = Job::new("BTCUSD", "1h", serde_json::json!({}));
        assert_eq!(job_progress(&job, now, expected), 0);

        job.mark_queued(10, now);
        assert_eq!(job_progress(&job, now, expected), 0);

        job.mark_in_progress(now - chrono::Duration::seconds(15));
        assert_eq!(job_progress(&job, now, expected), 50);

        job.started_at = Some(now - chrono::Duration::minutes(5));
        assert_eq!(job_progress(&job, now, expected), 95);

        job.mark_failed("boom", now);
        assert_eq!(job_progress(&job, now, expected), -1);
    }
}
