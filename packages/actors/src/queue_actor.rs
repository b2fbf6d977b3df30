//! Queue actor: the local priority backlog and bounded-concurrency dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use notify::NotificationBus;
use ractor::{Actor, ActorProcessingErr, ActorRef, MessagingErr, RpcReplyPort};
use render_core::{
    Job, JobEventKind, JobId, JobStatus, QueuePosition, QueueStats, QueueStatus,
    WebhookEventType,
};
use webhooks::WebhookDispatcher;

use crate::error::QueueError;
use crate::executor::{ExecutionResult, JobExecutor};
use crate::gate::{ClaimHold, DispatchGate, OpenGate, Selection};
use crate::messages::QueueMessage;
use crate::mirror::StoreMirror;

/// Local queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs allowed to run at once in this process.
    pub max_concurrent: usize,
    /// Executor runs longer than this fail with "Job timed out".
    pub job_timeout: Duration,
    /// Assumed job duration before any job has finished.
    pub default_job_duration: Duration,
    /// How long finished jobs stay readable in memory.
    pub finished_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            job_timeout: Duration::from_secs(600),
            default_job_duration: Duration::from_secs(30),
            finished_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }
}

/// A backlog entry. The backlog is kept sorted by `(priority, queued_at)`.
#[derive(Debug, Clone)]
struct QueueEntry {
    job: Job,
    priority: i32,
    queued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn new(job: Job, priority: i32, queued_at: DateTime<Utc>) -> Self {
        Self {
            job,
            priority,
            queued_at,
        }
    }

    fn key(&self) -> (i32, DateTime<Utc>) {
        (self.priority, self.queued_at)
    }
}

/// State for the queue actor.
pub struct QueueActorState {
    config: QueueConfig,
    backlog: Vec<QueueEntry>,
    running: HashMap<JobId, Job>,
    finished: HashMap<JobId, Job>,
    stats: QueueStats,
    last_queued_at: Option<DateTime<Utc>>,
    executor: Arc<dyn JobExecutor>,
    gate: Arc<dyn DispatchGate>,
    mirror: StoreMirror,
    bus: Option<NotificationBus>,
    webhooks: Option<WebhookDispatcher>,
    stopped: bool,
    /// A gate selection is running on its own task.
    selecting: bool,
    /// Something changed while a selection was out; select again after it.
    dispatch_again: bool,
}

impl QueueActorState {
    /// Create a queue state that dispatches through an [`OpenGate`].
    pub fn new(config: QueueConfig, executor: Arc<dyn JobExecutor>, mirror: StoreMirror) -> Self {
        Self {
            config,
            backlog: Vec::new(),
            running: HashMap::new(),
            finished: HashMap::new(),
            stats: QueueStats::default(),
            last_queued_at: None,
            executor,
            gate: Arc::new(OpenGate),
            mirror,
            bus: None,
            webhooks: None,
            stopped: false,
            selecting: false,
            dispatch_again: false,
        }
    }

    /// Set the gate every dispatch must pass.
    pub fn with_gate(mut self, gate: Arc<dyn DispatchGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Set the notification bus.
    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the webhook dispatcher for lifecycle events.
    pub fn with_webhooks(mut self, webhooks: WebhookDispatcher) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    fn is_tracked(&self, job_id: JobId) -> bool {
        self.running.contains_key(&job_id) || self.backlog.iter().any(|e| e.job.id == job_id)
    }

    /// Strictly increasing enqueue instant at microsecond precision, the
    /// store's resolution, so equal priorities never tie.
    fn next_queued_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        let at = match self.last_queued_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_queued_at = Some(at);
        at
    }

    fn observe_queued_at(&mut self, at: DateTime<Utc>) {
        if self.last_queued_at.is_none_or(|last| at > last) {
            self.last_queued_at = Some(at);
        }
    }

    fn insert(&mut self, entry: QueueEntry) {
        let key = entry.key();
        let index = self.backlog.partition_point(|e| e.key() <= key);
        self.backlog.insert(index, entry);
    }

    fn remove_queued(&mut self, job_id: JobId) -> Option<QueueEntry> {
        let index = self.backlog.iter().position(|e| e.job.id == job_id)?;
        Some(self.backlog.remove(index))
    }

    /// Drop local copies of jobs another worker owns. No store writes.
    fn evict(&mut self, job_ids: &[JobId]) -> usize {
        let mut evicted = 0;
        for job_id in job_ids {
            if self.remove_queued(*job_id).is_some() {
                tracing::info!(job_id = %job_id, "Dropped job owned by another worker");
                evicted += 1;
            }
        }
        evicted
    }

    /// Recompute 1-based positions, mirror them and announce moves.
    /// `quiet` is a job whose own event already carries its position.
    fn reposition(&mut self, quiet: Option<JobId>) {
        let mut positions = Vec::with_capacity(self.backlog.len());
        let mut moved = Vec::new();

        for (index, entry) in self.backlog.iter_mut().enumerate() {
            let position = index + 1;
            if entry.job.queue_position != Some(position) {
                entry.job.queue_position = Some(position);
                if Some(entry.job.id) != quiet {
                    moved.push(entry.job.clone());
                }
            }
            positions.push((entry.job.id, position));
        }

        self.mirror.update_positions(positions);
        for job in &moved {
            self.broadcast(job, JobEventKind::PositionChanged);
        }
    }

    fn queued_job(&self, job_id: JobId) -> Option<&Job> {
        self.backlog.iter().find(|e| e.job.id == job_id).map(|e| &e.job)
    }

    fn find_job(&self, job_id: JobId) -> Option<Job> {
        self.queued_job(job_id)
            .or_else(|| self.running.get(&job_id))
            .or_else(|| self.finished.get(&job_id))
            .cloned()
    }

    fn position_of(&self, job_id: JobId) -> Option<usize> {
        self.backlog
            .iter()
            .position(|e| e.job.id == job_id)
            .map(|index| index + 1)
    }

    /// Waves of `max_concurrent` jobs ahead, times the average run time.
    fn estimated_start(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        let position = self.position_of(job_id)?;
        let avg_ms = self
            .stats
            .avg_duration_ms
            .unwrap_or(self.config.default_job_duration.as_millis() as f64);
        let waves = (position - 1) / self.config.max_concurrent.max(1);
        Some(Utc::now() + ChronoDuration::milliseconds((waves as f64 * avg_ms) as i64))
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.backlog.len(),
            in_progress: self.running.len(),
            max_concurrent: self.config.max_concurrent,
            positions: self
                .backlog
                .iter()
                .enumerate()
                .map(|(index, e)| QueuePosition {
                    job_id: e.job.id,
                    position: index + 1,
                    priority: e.priority,
                    queued_at: e.queued_at,
                })
                .collect(),
        }
    }

    fn broadcast(&self, job: &Job, kind: JobEventKind) {
        if let Some(bus) = &self.bus {
            bus.broadcast_job_update(job, kind);
        }
    }

    fn trigger_webhooks(&self, job: &Job, event_type: WebhookEventType) {
        if let Some(webhooks) = &self.webhooks {
            let webhooks = webhooks.clone();
            let job = job.clone();
            tokio::spawn(async move {
                if let Err(e) = webhooks.trigger_webhooks(&job, event_type).await {
                    tracing::warn!(job_id = %job.id, "Failed to queue webhooks: {}", e);
                }
            });
        }
    }

    fn prune_finished(&mut self) {
        let Ok(retention) = ChronoDuration::from_std(self.config.finished_retention) else {
            return;
        };
        let cutoff = Utc::now() - retention;
        self.finished
            .retain(|_, job| job.finished_at.is_none_or(|at| at > cutoff));
    }

    fn start_job(&mut self, entry: QueueEntry, hold: Option<Box<dyn ClaimHold>>, myself: &ActorRef<QueueMessage>) {
        let mut job = entry.job;
        job.mark_in_progress(Utc::now());

        self.mirror.upsert_job(&job);
        self.mirror.remove_queue_row(job.id);
        self.running.insert(job.id, job.clone());

        tracing::info!(
            job_id = %job.id,
            attempts = job.attempts,
            wait_ms = job.wait_time_ms.unwrap_or_default(),
            "Job started"
        );
        self.broadcast(&job, JobEventKind::Started);

        let executor = self.executor.clone();
        let mirror = self.mirror.clone();
        let timeout = self.config.job_timeout;
        let myself = myself.clone();

        tokio::spawn(async move {
            let job_id = job.id;
            let outcome = run_job(executor, job.clone(), timeout).await;

            let mut job = job;
            let now = Utc::now();
            match outcome {
                Ok(result) => job.mark_succeeded(result, now),
                Err(error) => {
                    tracing::warn!(job_id = %job_id, "Job failed: {}", error);
                    job.mark_failed(error, now);
                }
            }

            // Terminal state must be durable before the lease goes away.
            mirror.upsert_job(&job);
            mirror.flush().await;
            if let Some(hold) = hold {
                hold.release().await;
            }

            if myself
                .send_message(QueueMessage::JobFinished { job: Box::new(job) })
                .is_err()
            {
                tracing::warn!(job_id = %job_id, "Queue stopped before job finished");
            }
        });
    }

    /// Ask the gate for the next job if a slot is free.
    ///
    /// The gate may go to the store, so it runs on its own task and answers
    /// with [`QueueMessage::Selected`]. One selection is out at a time.
    fn dispatch(&mut self, myself: &ActorRef<QueueMessage>) {
        if self.stopped
            || self.running.len() >= self.config.max_concurrent
            || self.backlog.is_empty()
        {
            return;
        }
        if self.selecting {
            self.dispatch_again = true;
            return;
        }
        self.selecting = true;
        self.dispatch_again = false;

        let candidates: Vec<JobId> = self.backlog.iter().map(|e| e.job.id).collect();
        let gate = self.gate.clone();
        let myself = myself.clone();

        tokio::spawn(async move {
            let selection = gate.select(candidates).await;
            if let Err(MessagingErr::SendErr(QueueMessage::Selected { selection })) =
                myself.send_message(QueueMessage::Selected { selection })
            {
                if let Some(claim) = selection.claim {
                    tracing::debug!(job_id = %claim.job_id, "Queue gone, releasing claim");
                    claim.release().await;
                }
            }
        });
    }

    /// Act on a finished selection. The backlog may have changed while the
    /// gate ran, so a claimed job is started only if it is still queued here.
    fn apply_selection(&mut self, selection: Selection, myself: &ActorRef<QueueMessage>) {
        self.selecting = false;
        let mut changed = self.evict(&selection.evicted) > 0;
        let mut started = false;

        if let Some(claim) = selection.claim {
            let entry = if self.stopped || self.running.len() >= self.config.max_concurrent {
                None
            } else {
                self.remove_queued(claim.job_id)
            };
            match entry {
                Some(entry) => {
                    self.start_job(entry, claim.hold, myself);
                    changed = true;
                    started = true;
                }
                None => {
                    tracing::info!(job_id = %claim.job_id, "Claimed job is no longer queued here");
                    tokio::spawn(claim.release());
                }
            }
        }

        if changed {
            self.reposition(None);
        }
        if started || self.dispatch_again {
            self.dispatch(myself);
        }
    }
}

/// Run the executor on its own task so panics and timeouts become failures.
async fn run_job(executor: Arc<dyn JobExecutor>, job: Job, timeout: Duration) -> ExecutionResult {
    let task = tokio::spawn(async move { executor.execute(job).await });
    let abort = task.abort_handle();

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => Err(format!("Job panicked: {}", panic_message(e.into_panic()))),
        Ok(Err(_)) => Err("Job was aborted".to_string()),
        Err(_) => {
            abort.abort();
            Err("Job timed out".to_string())
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Queue actor that owns one process's backlog.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(max_concurrent = args.config.max_concurrent, "Starting queue actor");
        Ok(args)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue {
                job,
                priority,
                reply,
            } => {
                let mut job = *job;
                if state.stopped {
                    let _ = reply.send(Err(QueueError::Stopped));
                    return Ok(());
                }
                if state.is_tracked(job.id) {
                    let _ = reply.send(Err(QueueError::AlreadyTracked(job.id)));
                    return Ok(());
                }

                let job_id = job.id;
                let priority = priority.unwrap_or(job.priority);
                let queued_at = state.next_queued_at();
                job.mark_queued(priority, queued_at);
                state.finished.remove(&job_id);

                state.mirror.upsert_job(&job);
                state.mirror.enqueue_row(job_id, priority, queued_at);
                state.insert(QueueEntry::new(job, priority, queued_at));
                state.reposition(Some(job_id));

                let queued = state.queued_job(job_id).cloned();
                if let Some(job) = &queued {
                    tracing::info!(job_id = %job_id, priority, position = ?job.queue_position, "Job queued");
                    state.broadcast(job, JobEventKind::Queued);
                }
                state.dispatch(&myself);
                let _ = reply.send(queued.ok_or(QueueError::NotFound(job_id)));
            }

            QueueMessage::Restore { jobs, reply } => {
                let mut adopted = 0;
                for mut job in jobs {
                    if job.status != JobStatus::Queued || state.is_tracked(job.id) {
                        continue;
                    }
                    let queued_at = match job.queued_at {
                        Some(at) => {
                            state.observe_queued_at(at);
                            at
                        }
                        None => state.next_queued_at(),
                    };
                    job.queued_at = Some(queued_at);
                    state.finished.remove(&job.id);

                    state.mirror.enqueue_row(job.id, job.priority, queued_at);
                    state.broadcast(&job, JobEventKind::Requeued);
                    let priority = job.priority;
                    state.insert(QueueEntry::new(job, priority, queued_at));
                    adopted += 1;
                }

                if adopted > 0 {
                    tracing::info!(adopted, "Adopted queued jobs from the store");
                    state.reposition(None);
                    state.dispatch(&myself);
                }
                let _ = reply.send(adopted);
            }

            QueueMessage::ProcessNext => {
                state.dispatch(&myself);
            }

            QueueMessage::Selected { selection } => {
                state.apply_selection(selection, &myself);
            }

            QueueMessage::Evict { job_ids, reply } => {
                let evicted = state.evict(&job_ids);
                if evicted > 0 {
                    state.reposition(None);
                }
                let _ = reply.send(evicted);
            }

            QueueMessage::JobFinished { job } => {
                let job = *job;
                if state.running.remove(&job.id).is_none() {
                    tracing::warn!(job_id = %job.id, "Finished job was not running");
                }

                let succeeded = job.status == JobStatus::Succeeded;
                if succeeded {
                    state.stats.succeeded += 1;
                } else {
                    state.stats.failed += 1;
                }
                if let Some(duration_ms) = job.duration_ms {
                    state.stats.record_duration(duration_ms);
                }

                tracing::info!(
                    job_id = %job.id,
                    status = %job.status,
                    duration_ms = job.duration_ms.unwrap_or_default(),
                    "Job finished"
                );

                if succeeded {
                    state.broadcast(&job, JobEventKind::Completed);
                    state.trigger_webhooks(&job, WebhookEventType::JobCompleted);
                } else {
                    state.broadcast(&job, JobEventKind::Failed);
                    state.trigger_webhooks(&job, WebhookEventType::JobFailed);
                }

                state.finished.insert(job.id, job);
                state.prune_finished();
                state.dispatch(&myself);
            }

            QueueMessage::Cancel { job_id, reply } => {
                let result = match state.remove_queued(job_id) {
                    Some(entry) => {
                        let mut job = entry.job;
                        job.mark_failed("Cancelled", Utc::now());

                        state.mirror.update_queued(&job);
                        tracing::info!(job_id = %job_id, "Job cancelled");
                        state.broadcast(&job, JobEventKind::Cancelled);
                        state.trigger_webhooks(&job, WebhookEventType::JobCancelled);

                        state.finished.insert(job_id, job.clone());
                        state.reposition(None);
                        Ok(job)
                    }
                    None if state.running.contains_key(&job_id)
                        || state.finished.contains_key(&job_id) =>
                    {
                        Err(QueueError::NotQueued(job_id))
                    }
                    None => Err(QueueError::NotFound(job_id)),
                };
                let _ = reply.send(result);
            }

            QueueMessage::UpdatePriority {
                job_id,
                priority,
                reply,
            } => {
                let result = match state.remove_queued(job_id) {
                    Some(mut entry) => {
                        entry.priority = priority;
                        entry.job.priority = priority;
                        entry.job.updated_at = Utc::now();

                        state.mirror.update_queued(&entry.job);
                        state.insert(entry);
                        state.reposition(Some(job_id));

                        match state.queued_job(job_id).cloned() {
                            Some(job) => {
                                state.broadcast(&job, JobEventKind::PriorityChanged);
                                Ok(job)
                            }
                            None => Err(QueueError::NotFound(job_id)),
                        }
                    }
                    None if state.running.contains_key(&job_id)
                        || state.finished.contains_key(&job_id) =>
                    {
                        Err(QueueError::NotQueued(job_id))
                    }
                    None => Err(QueueError::NotFound(job_id)),
                };
                let _ = reply.send(result);
            }

            QueueMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.find_job(job_id));
            }

            QueueMessage::GetJobPosition { job_id, reply } => {
                let _ = reply.send(state.position_of(job_id));
            }

            QueueMessage::GetEstimatedStartTime { job_id, reply } => {
                let _ = reply.send(state.estimated_start(job_id));
            }

            QueueMessage::GetStatus { reply } => {
                let _ = reply.send(state.status());
            }

            QueueMessage::GetStats { reply } => {
                let _ = reply.send(state.stats.clone());
            }

            QueueMessage::Forget { job_ids } => {
                for job_id in job_ids {
                    state.finished.remove(&job_id);
                }
            }

            QueueMessage::Stop { reply } => {
                state.stopped = true;
                tracing::info!(
                    queued = state.backlog.len(),
                    running = state.running.len(),
                    "Queue stopped dispatching"
                );
                let _ = reply.send(());
            }
        }

        Ok(())
    }
}

/// Handle to a running queue actor.
#[derive(Clone)]
pub struct PriorityQueue {
    actor: ActorRef<QueueMessage>,
    mirror: StoreMirror,
}

impl PriorityQueue {
    /// Spawn the queue actor.
    pub async fn spawn(state: QueueActorState) -> Result<Self, QueueError> {
        let mirror = state.mirror.clone();
        let (actor, _handle) = Actor::spawn(None, QueueActor, state)
            .await
            .map_err(|e| QueueError::Actor(format!("Failed to spawn queue: {}", e)))?;
        Ok(Self { actor, mirror })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(RpcReplyPort<T>) -> QueueMessage,
    ) -> Result<T, QueueError>
    where
        T: Send + 'static,
    {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(build(tx.into()))
            .map_err(|e| QueueError::Actor(format!("Failed to send message: {}", e)))?;
        rx.await
            .map_err(|_| QueueError::Actor("Failed to receive response".to_string()))
    }

    /// Admit a job. `priority` overrides the job's own priority.
    pub async fn enqueue(&self, job: Job, priority: Option<i32>) -> Result<Job, QueueError> {
        self.request(|reply| QueueMessage::Enqueue {
            job: Box::new(job),
            priority,
            reply,
        })
        .await?
    }

    /// Adopt jobs already queued in the store. Returns how many were new here.
    pub async fn restore(&self, jobs: Vec<Job>) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        self.request(|reply| QueueMessage::Restore { jobs, reply }).await
    }

    /// Ask the queue to fill free slots.
    pub fn process_next(&self) -> Result<(), QueueError> {
        self.actor
            .send_message(QueueMessage::ProcessNext)
            .map_err(|e| QueueError::Actor(format!("Failed to send message: {}", e)))
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job, QueueError> {
        self.request(|reply| QueueMessage::Cancel { job_id, reply })
            .await?
    }

    pub async fn update_priority(&self, job_id: JobId, priority: i32) -> Result<Job, QueueError> {
        self.request(|reply| QueueMessage::UpdatePriority {
            job_id,
            priority,
            reply,
        })
        .await?
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        self.request(|reply| QueueMessage::GetJob { job_id, reply })
            .await
    }

    pub async fn get_job_position(&self, job_id: JobId) -> Result<Option<usize>, QueueError> {
        self.request(|reply| QueueMessage::GetJobPosition { job_id, reply })
            .await
    }

    pub async fn get_estimated_start_time(
        &self,
        job_id: JobId,
    ) -> Result<Option<DateTime<Utc>>, QueueError> {
        self.request(|reply| QueueMessage::GetEstimatedStartTime { job_id, reply })
            .await
    }

    pub async fn get_status(&self) -> Result<QueueStatus, QueueError> {
        self.request(|reply| QueueMessage::GetStatus { reply }).await
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        self.request(|reply| QueueMessage::GetStats { reply }).await
    }

    /// Drop queued jobs another worker has taken. Returns how many were here.
    pub async fn evict(&self, job_ids: Vec<JobId>) -> Result<usize, QueueError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        self.request(|reply| QueueMessage::Evict { job_ids, reply })
            .await
    }

    /// Drop finished jobs from memory.
    pub fn forget(&self, job_ids: Vec<JobId>) {
        if !job_ids.is_empty() {
            let _ = self.actor.send_message(QueueMessage::Forget { job_ids });
        }
    }

    /// Wait until every store write issued so far has landed.
    pub async fn flush(&self) {
        self.mirror.flush().await;
    }

    /// Stop dispatching new jobs. Running jobs still report back.
    pub async fn stop_dispatch(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueMessage::Stop { reply }).await
    }

    /// Stop dispatching, stop the actor and flush pending store writes.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_dispatch().await {
            tracing::debug!("Queue already stopped: {}", e);
        }
        self.actor.stop(None);
        self.mirror.flush().await;
    }
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("actor", &self.actor.get_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: i32, micros: i64) -> QueueEntry {
        let at = DateTime::from_timestamp_micros(1_700_000_000_000_000 + micros).unwrap();
        QueueEntry::new(Job::new("BTCUSD", "1h", serde_json::json!({})), priority, at)
    }

    fn keys(backlog: &[QueueEntry]) -> Vec<(i32, i64)> {
        backlog
            .iter()
            .map(|e| (e.priority, e.queued_at.timestamp_micros() - 1_700_000_000_000_000))
            .collect()
    }

    #[test]
    fn insert_keeps_priority_then_fifo_order() {
        let mut backlog: Vec<QueueEntry> = Vec::new();
        for e in [entry(50, 1), entry(10, 2), entry(50, 3), entry(10, 4), entry(-5, 5)] {
            let key = e.key();
            let index = backlog.partition_point(|x| x.key() <= key);
            backlog.insert(index, e);
        }
        assert_eq!(keys(&backlog), vec![(-5, 5), (10, 2), (10, 4), (50, 1), (50, 3)]);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bad frame"))), "bad frame");
        assert_eq!(panic_message(Box::new(42_u8)), "unknown panic");
    }
}
