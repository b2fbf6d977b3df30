mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use actors::{
    Claim, ClaimHold, DispatchGate, GateFuture, PriorityQueue, QueueActorState, QueueConfig, QueueError,
    Selection, StoreMirror,
};
use chrono::{Duration as ChronoDuration, Utc};
use db::Store;
use notify::{NotificationBus, ObserverMessage};
use render_core::{Job, JobEventKind, JobId, JobStatus, NotificationEvent};
use serde_json::json;
use tokio::sync::Notify;

use common::{Recorder, eventually, held_job, job, store};

async fn queue(store: &Store, recorder: &Arc<Recorder>, config: QueueConfig) -> Result<PriorityQueue, QueueError> {
    let state = QueueActorState::new(config, recorder.executor(), StoreMirror::spawn(store.clone()));
    PriorityQueue::spawn(state).await
}

/// Claims the first candidate once `go` fires, like a gate stuck on a slow store.
struct ParkedGate {
    go: Arc<Notify>,
    released: Arc<AtomicBool>,
}

struct FlagHold(Arc<AtomicBool>);

impl ClaimHold for FlagHold {
    fn release(self: Box<Self>) -> GateFuture<'static, ()> {
        Box::pin(async move { self.0.store(true, Ordering::SeqCst) })
    }
}

impl DispatchGate for ParkedGate {
    fn select(&self, candidates: Vec<JobId>) -> GateFuture<'_, Selection> {
        Box::pin(async move {
            self.go.notified().await;
            Selection {
                claim: candidates.first().copied().map(|job_id| Claim {
                    job_id,
                    hold: Some(Box::new(FlagHold(self.released.clone()))),
                }),
                evicted: Vec::new(),
            }
        })
    }
}

async fn parked_queue(store: &Store, recorder: &Arc<Recorder>) -> Result<(PriorityQueue, Arc<ParkedGate>), QueueError> {
    let gate = Arc::new(ParkedGate {
        go: Arc::new(Notify::new()),
        released: Arc::new(AtomicBool::new(false)),
    });
    let state = QueueActorState::new(
        QueueConfig::default().with_max_concurrent(1),
        recorder.executor(),
        StoreMirror::spawn(store.clone()),
    )
    .with_gate(gate.clone());
    Ok((PriorityQueue::spawn(state).await?, gate))
}

async fn status_of(queue: &PriorityQueue, job_id: JobId) -> Option<JobStatus> {
    queue.get_job(job_id).await.ok().flatten().map(|j| j.status)
}

#[tokio::test]
async fn more_urgent_job_starts_first() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    let blocker = queue.enqueue(held_job("BLOCK"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);

    let j1 = queue.enqueue(job("J1"), Some(50)).await?;
    let j2 = queue.enqueue(job("J2"), Some(10)).await?;
    assert_eq!(j1.queue_position, Some(1));
    assert_eq!(j2.queue_position, Some(1));
    assert_eq!(queue.get_job_position(j2.id).await?, Some(1));
    assert_eq!(queue.get_job_position(j1.id).await?, Some(2));

    recorder.release(1);
    assert!(eventually(|| async { recorder.started().len() == 3 }).await);
    assert_eq!(recorder.started(), vec![blocker.id, j2.id, j1.id]);

    assert!(eventually(|| async { status_of(&queue, j1.id).await == Some(JobStatus::Succeeded) }).await);
    let stats = queue.get_stats().await?;
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.success_rate(), Some(100.0));
    Ok(())
}

#[tokio::test]
async fn equal_priority_runs_in_enqueue_order() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    let blocker = queue.enqueue(held_job("BLOCK"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);
    let mut expected = vec![blocker.id];
    for symbol in ["A", "B", "C", "D"] {
        expected.push(queue.enqueue(job(symbol), Some(20)).await?.id);
    }

    let status = queue.get_status().await?;
    assert_eq!(status.queued, 4);
    assert_eq!(status.in_progress, 1);
    assert_eq!(status.available_slots(), 0);
    let positions: Vec<usize> = status.positions.iter().map(|p| p.position).collect();
    assert_eq!(positions, vec![1, 2, 3, 4]);

    recorder.release(1);
    assert!(eventually(|| async { recorder.started().len() == 5 }).await);
    assert_eq!(recorder.started(), expected);
    Ok(())
}

#[tokio::test]
async fn fills_every_free_slot() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(3)).await?;

    for symbol in ["A", "B", "C", "D"] {
        queue.enqueue(held_job(symbol), None).await?;
    }

    assert!(eventually(|| async { recorder.started().len() == 3 }).await);
    let status = queue.get_status().await?;
    assert_eq!(status.in_progress, 3);
    assert_eq!(status.queued, 1);

    recorder.release(4);
    assert!(eventually(|| async { queue.get_stats().await.map(|s| s.succeeded).unwrap_or(0) == 4 }).await);
    Ok(())
}

#[tokio::test]
async fn estimated_start_counts_waves_ahead() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    queue.enqueue(held_job("BLOCK"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);
    let first = queue.enqueue(job("A"), None).await?;
    queue.enqueue(job("B"), None).await?;
    let third = queue.enqueue(job("C"), None).await?;

    let now = Utc::now();
    let first_at = queue.get_estimated_start_time(first.id).await?.unwrap();
    let third_at = queue.get_estimated_start_time(third.id).await?.unwrap();
    assert!((first_at - now).num_seconds().abs() <= 1);
    let ahead = third_at - now;
    assert!(ahead > ChronoDuration::seconds(58) && ahead < ChronoDuration::seconds(62));

    assert_eq!(queue.get_estimated_start_time(JobId::new()).await?, None);
    Ok(())
}

#[tokio::test]
async fn cancel_only_touches_queued_jobs() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    let blocker = queue.enqueue(held_job("BLOCK"), None).await?;
    let waiting = queue.enqueue(job("WAIT"), None).await?;
    let behind = queue.enqueue(job("BEHIND"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);

    let cancelled = queue.cancel_job(waiting.id).await?;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("Cancelled"));
    assert_eq!(queue.get_job_position(behind.id).await?, Some(1));

    assert_eq!(queue.cancel_job(blocker.id).await, Err(QueueError::NotQueued(blocker.id)));
    assert_eq!(queue.cancel_job(waiting.id).await, Err(QueueError::NotQueued(waiting.id)));
    let unknown = JobId::new();
    assert_eq!(queue.cancel_job(unknown).await, Err(QueueError::NotFound(unknown)));

    queue.flush().await;
    let stored = store.jobs.get(waiting.id).await?;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(store.queue.count().await?, 1);

    recorder.release(1);
    assert!(eventually(|| async { status_of(&queue, behind.id).await == Some(JobStatus::Succeeded) }).await);
    assert!(!recorder.started().contains(&waiting.id));
    Ok(())
}

#[tokio::test]
async fn priority_update_moves_job_but_keeps_enqueue_time() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    queue.enqueue(held_job("BLOCK"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);
    let a = queue.enqueue(job("A"), Some(50)).await?;
    let b = queue.enqueue(job("B"), Some(60)).await?;
    assert_eq!(queue.get_job_position(b.id).await?, Some(2));

    let moved = queue.update_priority(b.id, 10).await?;
    assert_eq!(moved.priority, 10);
    assert_eq!(moved.queued_at, b.queued_at);
    assert_eq!(moved.queue_position, Some(1));
    assert_eq!(queue.get_job_position(a.id).await?, Some(2));

    let unknown = JobId::new();
    assert_eq!(queue.update_priority(unknown, 1).await, Err(QueueError::NotFound(unknown)));
    Ok(())
}

#[tokio::test]
async fn duplicate_enqueue_is_rejected() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    let running = queue.enqueue(held_job("RUN"), None).await?;
    let waiting = queue.enqueue(job("WAIT"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);

    let again = queue.enqueue(waiting.clone(), None).await;
    assert_eq!(again, Err(QueueError::AlreadyTracked(waiting.id)));
    let again = queue.enqueue(running.clone(), None).await;
    assert_eq!(again, Err(QueueError::AlreadyTracked(running.id)));
    assert_eq!(queue.get_status().await?.queued, 1);
    Ok(())
}

#[tokio::test]
async fn timed_out_job_fails() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let config = QueueConfig::default().with_job_timeout(Duration::from_millis(50));
    let queue = queue(&store, &recorder, config).await?;

    let slow = queue
        .enqueue(Job::new("SLOW", "1d", json!({ "sleep_ms": 10_000 })), None)
        .await?;
    let quick = queue.enqueue(job("QUICK"), None).await?;

    assert!(eventually(|| async { status_of(&queue, slow.id).await == Some(JobStatus::Failed) }).await);
    let failed = queue.get_job(slow.id).await?.unwrap();
    assert_eq!(failed.error.as_deref(), Some("Job timed out"));
    assert!(eventually(|| async { status_of(&queue, quick.id).await == Some(JobStatus::Succeeded) }).await);

    queue.flush().await;
    assert_eq!(store.jobs.get(slow.id).await?.status, JobStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn panicking_executor_fails_the_job_and_queue_keeps_going() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    let bad = queue
        .enqueue(Job::new("BAD", "1h", json!({ "panic": true })), None)
        .await?;
    let good = queue.enqueue(job("GOOD"), None).await?;

    assert!(eventually(|| async { status_of(&queue, good.id).await == Some(JobStatus::Succeeded) }).await);
    let failed = queue.get_job(bad.id).await?.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Job panicked: renderer crashed"));

    let stats = queue.get_stats().await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn restore_keeps_original_enqueue_time() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default().with_max_concurrent(1)).await?;

    queue.enqueue(held_job("BLOCK"), None).await?;
    assert!(eventually(|| async { recorder.started().len() == 1 }).await);
    let fresh = queue.enqueue(job("FRESH"), Some(30)).await?;

    let mut old = job("OLD");
    let queued_at = Utc::now() - ChronoDuration::minutes(5);
    old.mark_queued(30, queued_at);
    let pending = job("PENDING");

    let adopted = queue
        .restore(vec![old.clone(), old.clone(), pending.clone(), fresh.clone()])
        .await?;
    assert_eq!(adopted, 1);

    let restored = queue.get_job(old.id).await?.unwrap();
    assert_eq!(restored.queued_at, Some(queued_at));
    assert_eq!(queue.get_job_position(old.id).await?, Some(1));
    assert_eq!(queue.get_job_position(fresh.id).await?, Some(2));
    assert_eq!(queue.get_job(pending.id).await?, None);
    Ok(())
}

#[tokio::test]
async fn lifecycle_events_reach_observers() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let bus = NotificationBus::default();
    let mut observer = bus.connect();
    observer.subscribe_all();

    let state = QueueActorState::new(
        QueueConfig::default().with_max_concurrent(1),
        recorder.executor(),
        StoreMirror::spawn(store.clone()),
    )
    .with_bus(bus.clone());
    let queue = PriorityQueue::spawn(state).await?;

    let job = queue.enqueue(job("OBSERVED"), None).await?;
    assert!(eventually(|| async { status_of(&queue, job.id).await == Some(JobStatus::Succeeded) }).await);

    let mut kinds = Vec::new();
    while let Some(message) = observer.try_recv() {
        if let ObserverMessage::Event(NotificationEvent::JobUpdate { event_type, job: snapshot, .. }) = message {
            assert_eq!(snapshot.id, job.id);
            kinds.push(event_type);
        }
    }
    assert_eq!(
        kinds,
        vec![JobEventKind::Queued, JobEventKind::Started, JobEventKind::Completed]
    );
    Ok(())
}

#[tokio::test]
async fn stopped_queue_refuses_new_jobs() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let queue = queue(&store, &recorder, QueueConfig::default()).await?;

    queue.stop_dispatch().await?;
    assert_eq!(queue.enqueue(job("LATE"), None).await, Err(QueueError::Stopped));
    Ok(())
}

#[tokio::test]
async fn queries_answer_while_the_gate_is_busy() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let (queue, gate) = parked_queue(&store, &recorder).await?;

    let waiting = queue.enqueue(job("WAIT"), None).await?;
    let status = tokio::time::timeout(Duration::from_millis(500), queue.get_status()).await??;
    assert_eq!(status.queued, 1);
    assert_eq!(status.in_progress, 0);
    let position = tokio::time::timeout(Duration::from_millis(500), queue.get_job_position(waiting.id)).await??;
    assert_eq!(position, Some(1));
    // A nudge while a selection is out waits for it instead of starting another.
    queue.process_next()?;
    assert_eq!(queue.get_status().await?.in_progress, 0);

    gate.go.notify_one();
    assert!(eventually(|| async { status_of(&queue, waiting.id).await == Some(JobStatus::Succeeded) }).await);
    assert!(gate.released.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn claim_on_a_cancelled_job_is_given_back() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let recorder = Recorder::new();
    let (queue, gate) = parked_queue(&store, &recorder).await?;

    let doomed = queue.enqueue(job("DOOMED"), None).await?;
    let cancelled = queue.cancel_job(doomed.id).await?;
    assert_eq!(cancelled.status, JobStatus::Failed);

    gate.go.notify_one();
    assert!(eventually(|| async { gate.released.load(Ordering::SeqCst) }).await);
    assert!(recorder.started().is_empty());

    let status = queue.get_status().await?;
    assert_eq!(status.queued, 0);
    assert_eq!(status.in_progress, 0);
    Ok(())
}
