#![allow(clippy::disallowed_methods)]

use chrono::{Duration, Utc};
use futures_util::future::join_all;
use render_core::{
    DeliveryStatus, Job, JobId, JobResult, JobStatus, WebhookEvent, WebhookEventType,
    WorkerRecord, WorkerStatus,
};
use serde_json::json;
use std::error::Error;

use db::{DbConfig, DbError, Store};

async fn store() -> Result<Store, DbError> {
    db::open(DbConfig::memory()).await
}

fn queued_job(symbol: &str, priority: i32) -> Job {
    let mut job = Job::new(symbol, "1h", json!({ "theme": "dark" }));
    job.mark_queued(priority, Utc::now());
    job
}

#[tokio::test]
async fn job_repository_round_trips_and_filters() -> Result<(), Box<dyn Error>> {
    let store = store().await?;

    let job = queued_job("BTCUSD", 20).with_webhook("https://hooks.example.com/a");
    let written = store.jobs.upsert(&job).await?;
    assert_eq!(written.id, job.id);
    assert_eq!(written.webhook_urls, job.webhook_urls);

    let loaded = store.jobs.get(job.id).await?;
    assert_eq!(loaded.symbol, "BTCUSD");
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.priority, 20);
    assert_eq!(loaded.payload["theme"], "dark");

    let missing = store.jobs.get(JobId::new()).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));
    assert!(store.jobs.find(JobId::new()).await?.is_none());

    let urgent = queued_job("ETHUSD", 5);
    store.jobs.upsert(&urgent).await?;

    let mut done = queued_job("SOLUSD", 1);
    done.mark_in_progress(Utc::now());
    done.mark_succeeded(JobResult::new("rendered"), Utc::now());
    store.jobs.upsert(&done).await?;

    let queued = store.jobs.list_by_status(JobStatus::Queued).await?;
    let ids: Vec<JobId> = queued.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![urgent.id, job.id]);

    let counts = store.jobs.count_by_status().await?;
    assert_eq!(counts.get("queued").copied().unwrap_or(0), 2);
    assert_eq!(counts.get("succeeded").copied().unwrap_or(0), 1);

    store
        .jobs
        .update_positions(&[(urgent.id, 1), (job.id, 2), (done.id, 3)])
        .await?;
    assert_eq!(store.jobs.get(urgent.id).await?.queue_position, Some(1));
    assert_eq!(store.jobs.get(job.id).await?.queue_position, Some(2));
    assert_eq!(store.jobs.get(done.id).await?.queue_position, None);
    store.jobs.update_positions(&[]).await?;

    store.jobs.delete(job.id).await?;
    assert!(store.jobs.find(job.id).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn requeue_only_moves_in_progress_jobs_once() -> Result<(), Box<dyn Error>> {
    let store = store().await?;

    let mut job = queued_job("BTCUSD", 10);
    job.mark_in_progress(Utc::now());
    store.jobs.upsert(&job).await?;

    let orphans = store.jobs.in_progress_without_lease().await?;
    assert_eq!(orphans.len(), 1);

    let first = store.jobs.requeue(job.id, Utc::now()).await?;
    let requeued = first.ok_or("expected requeue")?;
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.started_at, None);
    assert_eq!(requeued.attempts, 1);

    let second = store.jobs.requeue(job.id, Utc::now()).await?;
    assert!(second.is_none());
    assert!(store.jobs.in_progress_without_lease().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn conditional_update_leaves_started_jobs_alone() -> Result<(), Box<dyn Error>> {
    let store = store().await?;

    let waiting = queued_job("BTCUSD", 10);
    store.jobs.upsert(&waiting).await?;
    let mut cancelled = waiting.clone();
    cancelled.mark_failed("Cancelled", Utc::now());
    let written = store
        .jobs
        .update_if_queued(&cancelled)
        .await?
        .ok_or("queued row should accept the update")?;
    assert_eq!(written.status, JobStatus::Failed);
    assert_eq!(written.error.as_deref(), Some("Cancelled"));

    let mut running = queued_job("ETHUSD", 10);
    running.mark_in_progress(Utc::now());
    store.jobs.upsert(&running).await?;
    let mut stale = running.clone();
    stale.status = JobStatus::Queued;
    stale.priority = 1;
    assert!(store.jobs.update_if_queued(&stale).await?.is_none());

    let stored = store.jobs.get(running.id).await?;
    assert_eq!(stored.status, JobStatus::InProgress);
    assert_eq!(stored.priority, 10);

    assert!(store.jobs.update_if_queued(&queued_job("SOLUSD", 1)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn retention_deletes_only_old_terminal_jobs() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let now = Utc::now();

    let mut old = queued_job("BTCUSD", 10);
    old.mark_in_progress(now - Duration::hours(30));
    old.mark_failed("boom", now - Duration::hours(25));
    store.jobs.upsert(&old).await?;

    let mut recent = queued_job("ETHUSD", 10);
    recent.mark_in_progress(now - Duration::minutes(5));
    recent.mark_succeeded(JobResult::new("ok"), now - Duration::minutes(4));
    store.jobs.upsert(&recent).await?;

    let waiting = queued_job("SOLUSD", 10);
    store.jobs.upsert(&waiting).await?;

    let deleted = store.jobs.delete_finished_before(now - Duration::hours(24)).await?;
    assert_eq!(deleted, vec![old.id]);
    assert!(store.jobs.find(recent.id).await?.is_some());
    assert!(store.jobs.find(waiting.id).await?.is_some());

    Ok(())
}

#[tokio::test]
async fn queue_entries_list_in_dispatch_order() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let t0 = Utc::now();

    let a = JobId::new();
    let b = JobId::new();
    let c = JobId::new();
    store.queue.upsert(a, 50, t0).await?;
    store.queue.upsert(b, 10, t0 + Duration::microseconds(1)).await?;
    store.queue.upsert(c, 50, t0 + Duration::microseconds(2)).await?;

    let order: Vec<JobId> = store.queue.list().await?.into_iter().map(|e| e.job_id).collect();
    assert_eq!(order, vec![b, a, c]);
    assert_eq!(store.queue.count().await?, 3);

    // Re-prioritising keeps a single row per job.
    store.queue.upsert(c, 1, t0 + Duration::microseconds(2)).await?;
    let entries = store.queue.list().await?;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].job_id, c);
    assert_eq!(entries[0].priority, 1);

    store.queue.remove(a).await?;
    store.queue.remove(a).await?;
    assert_eq!(store.queue.count().await?, 2);

    Ok(())
}

#[tokio::test]
async fn lease_is_exclusive_per_job() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let now = Utc::now();
    let job_id = JobId::new();

    let lease = store
        .leases
        .acquire(job_id, "worker-a", now, now + Duration::seconds(30))
        .await?
        .ok_or("worker-a should win the lease")?;
    assert_eq!(lease.worker_id, "worker-a");
    assert!(lease.is_live(now));

    let contended = store
        .leases
        .acquire(job_id, "worker-b", now, now + Duration::seconds(30))
        .await?;
    assert!(contended.is_none());

    // Only the holder may renew or release.
    let stolen = store.leases.renew(job_id, "worker-b", now + Duration::seconds(60)).await?;
    assert!(stolen.is_none());
    assert!(!store.leases.release(job_id, "worker-b").await?);

    let renewed = store
        .leases
        .renew(job_id, "worker-a", now + Duration::seconds(60))
        .await?
        .ok_or("holder should renew")?;
    assert_eq!(renewed.renewed_count, 1);
    assert_eq!(renewed.expires_at.timestamp_micros(), (now + Duration::seconds(60)).timestamp_micros());

    assert_eq!(store.leases.live_job_ids(now).await?, vec![job_id]);
    assert!(store.leases.release(job_id, "worker-a").await?);
    assert!(store.leases.get(job_id).await?.is_none());

    let retaken = store
        .leases
        .acquire(job_id, "worker-b", now, now + Duration::seconds(30))
        .await?;
    assert!(retaken.is_some());

    Ok(())
}

#[tokio::test]
async fn concurrent_acquires_have_one_winner() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let now = Utc::now();
    let job_id = JobId::new();

    let attempts = (0..8).map(|n| {
        let leases = store.leases.clone();
        let worker_id = format!("worker-{}", n);
        async move {
            leases
                .acquire(job_id, &worker_id, now, now + Duration::seconds(30))
                .await
        }
    });
    let results = join_all(attempts).await;

    let mut winners = Vec::new();
    for result in results {
        if let Some(lease) = result? {
            winners.push(lease.worker_id);
        }
    }
    assert_eq!(winners.len(), 1);

    let held = store.leases.get(job_id).await?.ok_or("lease row missing")?;
    assert_eq!(held.worker_id, winners[0]);
    Ok(())
}

#[tokio::test]
async fn live_leases_can_be_filtered_by_holder() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let now = Utc::now();
    let mine = JobId::new();
    let theirs = JobId::new();
    let expired = JobId::new();

    store.leases.acquire(mine, "worker-a", now, now + Duration::minutes(1)).await?;
    store.leases.acquire(theirs, "worker-b", now, now + Duration::minutes(1)).await?;
    store
        .leases
        .acquire(expired, "worker-b", now - Duration::minutes(2), now - Duration::minutes(1))
        .await?;

    assert_eq!(store.leases.live_held_by_others("worker-a", now).await?, vec![theirs]);
    assert_eq!(store.leases.live_held_by_others("worker-b", now).await?, vec![mine]);
    Ok(())
}

#[tokio::test]
async fn expired_leases_are_taken_once() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let now = Utc::now();
    let stale = JobId::new();
    let live = JobId::new();

    store
        .leases
        .acquire(stale, "worker-a", now - Duration::minutes(2), now - Duration::minutes(1))
        .await?;
    store
        .leases
        .acquire(live, "worker-a", now, now + Duration::minutes(1))
        .await?;

    assert_eq!(store.leases.live_job_ids(now).await?, vec![live]);

    let expired = store.leases.take_expired(now).await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].job_id, stale);
    assert!(store.leases.take_expired(now).await?.is_empty());

    let released = store.leases.release_all("worker-a").await?;
    assert_eq!(released.len(), 1);
    assert!(store.leases.list_for_worker("worker-a").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn stale_workers_are_stopped_exactly_once() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let now = Utc::now();

    let mut crashed = WorkerRecord::new("worker-crashed", "host-a", 2);
    crashed.status = WorkerStatus::Active;
    crashed.active_jobs = 1;
    crashed.last_heartbeat = now - Duration::minutes(5);
    store.workers.upsert(&crashed).await?;

    let healthy = WorkerRecord::new("worker-healthy", "host-b", 2);
    store.workers.upsert(&healthy).await?;

    let beat = store
        .workers
        .heartbeat("worker-healthy", 1, WorkerStatus::Active, now)
        .await?
        .ok_or("healthy worker should accept heartbeat")?;
    assert_eq!(beat.active_jobs, 1);
    assert_eq!(beat.status, WorkerStatus::Active);

    let stopped = store
        .workers
        .mark_stale_stopped(now - Duration::seconds(90), now, "worker-healthy")
        .await?;
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, "worker-crashed");
    assert!(
        store
            .workers
            .mark_stale_stopped(now - Duration::seconds(90), now, "worker-healthy")
            .await?
            .is_empty()
    );

    let record = store.workers.get("worker-crashed").await?.ok_or("missing worker")?;
    assert_eq!(record.status, WorkerStatus::Stopped);
    assert!(
        store
            .workers
            .heartbeat("worker-crashed", 0, WorkerStatus::Idle, now)
            .await?
            .is_none()
    );

    let counts = store.workers.count_by_status().await?;
    assert_eq!(counts.get("stopped").copied().unwrap_or(0), 1);
    assert_eq!(counts.get("active").copied().unwrap_or(0), 1);
    assert_eq!(store.workers.list().await?.len(), 2);

    Ok(())
}

#[tokio::test]
async fn webhook_outbox_tracks_pending_rows() -> Result<(), Box<dyn Error>> {
    let store = store().await?;
    let job_id = JobId::new();

    let first = WebhookEvent::new(
        Some(job_id),
        WebhookEventType::JobCompleted,
        "https://hooks.example.com/done",
        json!({ "event": "job.completed" }),
    );
    store.webhooks.insert(&first).await?;

    let mut exhausted = WebhookEvent::new(
        Some(job_id),
        WebhookEventType::JobFailed,
        "https://hooks.example.com/failed",
        json!({ "event": "job.failed" }),
    );
    exhausted.attempts = 5;
    store.webhooks.insert(&exhausted).await?;

    let mut alert = WebhookEvent::new(
        None,
        WebhookEventType::QueueBacklog,
        "https://alerts.example.com",
        json!({ "event": "queue.backlog" }),
    );
    alert.created_at = first.created_at + Duration::milliseconds(5);
    store.webhooks.insert(&alert).await?;

    let pending = store.webhooks.pending(5, 10).await?;
    let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first.id, alert.id]);
    assert_eq!(store.webhooks.pending(5, 1).await?.len(), 1);

    let mut delivered = first.clone();
    delivered.attempts = 1;
    delivered.status = DeliveryStatus::Delivered;
    delivered.delivered_at = Some(Utc::now());
    store.webhooks.save(&delivered).await?;

    let reloaded = store.webhooks.get(first.id).await?.ok_or("missing event")?;
    assert_eq!(reloaded.status, DeliveryStatus::Delivered);
    assert_eq!(reloaded.attempts, 1);
    assert_eq!(reloaded.payload, first.payload);

    assert_eq!(store.webhooks.list_for_job(job_id).await?.len(), 2);
    assert_eq!(store.webhooks.list_by_type(WebhookEventType::QueueBacklog).await?.len(), 1);

    let removed = store
        .webhooks
        .delete_older_than(Utc::now() + Duration::seconds(1))
        .await?;
    assert_eq!(removed, 3);

    Ok(())
}
