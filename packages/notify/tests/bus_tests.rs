use std::time::Duration;

use chrono::Utc;
use notify::{BusConfig, NotificationBus, ObserverMessage};
use render_core::{Job, JobEventKind, JobStatus, NotificationEvent};
use serde_json::json;

fn queued_job(symbol: &str) -> Job {
    let mut job = Job::new(symbol, "1h", json!({}));
    job.mark_queued(10, Utc::now());
    job
}

#[tokio::test]
async fn job_updates_reach_matching_observers_only() {
    let bus = NotificationBus::default();
    let job = queued_job("BTCUSD");
    let other = queued_job("ETHUSD");

    let mut watcher = bus.connect();
    watcher.subscribe(job.id);
    let mut everything = bus.connect();
    everything.subscribe_all();
    let mut idle = bus.connect();

    assert_eq!(bus.broadcast_job_update(&job, JobEventKind::Queued), 2);
    assert_eq!(bus.broadcast_job_update(&other, JobEventKind::Queued), 1);

    match watcher.try_recv() {
        Some(ObserverMessage::Event(NotificationEvent::JobUpdate { event_type, job: snapshot, .. })) => {
            assert_eq!(event_type, JobEventKind::Queued);
            assert_eq!(snapshot.id, job.id);
            assert_eq!(snapshot.status, JobStatus::Queued);
            assert_eq!(snapshot.progress, 0);
        }
        other => panic!("unexpected message: {:?}", other),
    }
    assert!(watcher.try_recv().is_none());

    assert!(everything.try_recv().is_some());
    assert!(everything.try_recv().is_some());
    assert!(idle.try_recv().is_none());

    watcher.unsubscribe(job.id);
    assert_eq!(bus.broadcast_job_update(&job, JobEventKind::PositionChanged), 1);
    assert!(watcher.try_recv().is_none());
}

#[tokio::test]
async fn pattern_events_go_to_every_observer() {
    let bus = NotificationBus::default();
    let mut a = bus.connect();
    let mut b = bus.connect();

    assert_eq!(bus.broadcast_pattern_overlay(json!({ "patterns": [] })), 2);
    assert_eq!(bus.broadcast_pattern_delta(json!({ "added": ["wedge"] })), 2);

    for observer in [&mut a, &mut b] {
        match observer.recv().await {
            Some(ObserverMessage::Event(NotificationEvent::PatternOverlay { .. })) => {}
            other => panic!("expected overlay, got {:?}", other),
        }
        match observer.recv().await {
            Some(ObserverMessage::Event(NotificationEvent::PatternDelta { data, .. })) => {
                assert_eq!(data["added"][0], "wedge");
            }
            other => panic!("expected delta, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn lagging_observer_skips_messages_without_blocking() {
    let bus = NotificationBus::new(BusConfig::default().with_channel_capacity(1));
    let mut slow = bus.connect();
    slow.subscribe_all();

    let job = queued_job("SOLUSD");
    assert_eq!(bus.broadcast_job_update(&job, JobEventKind::Queued), 1);
    assert_eq!(bus.broadcast_job_update(&job, JobEventKind::PriorityChanged), 0);
    assert_eq!(bus.observer_count(), 1);

    assert!(slow.try_recv().is_some());
    assert!(slow.try_recv().is_none());
}

#[tokio::test]
async fn unanswered_ping_disconnects_observer() {
    let bus = NotificationBus::default();
    let mut responsive = bus.connect();
    let mut silent = bus.connect();

    assert_eq!(bus.ping_observers(), 0);
    assert_eq!(responsive.try_recv(), Some(ObserverMessage::Ping));
    assert_eq!(silent.try_recv(), Some(ObserverMessage::Ping));

    responsive.pong();
    assert_eq!(bus.ping_observers(), 1);
    assert_eq!(bus.observer_count(), 1);
    assert_eq!(responsive.try_recv(), Some(ObserverMessage::Ping));

    // The dropped observer's channel is closed.
    assert!(silent.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn liveness_task_reaps_silent_observers() {
    let bus = NotificationBus::new(BusConfig::default().with_ping_interval(Duration::from_secs(5)));
    bus.start();
    let mut silent = bus.connect();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(silent.recv().await, Some(ObserverMessage::Ping));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(silent.recv().await.is_none());
    assert_eq!(bus.observer_count(), 0);

    bus.shutdown();
}

#[tokio::test]
async fn shutdown_and_drop_close_observers() {
    let bus = NotificationBus::default();
    let mut kept = bus.connect();
    let dropped = bus.connect();
    assert_eq!(bus.observer_count(), 2);

    drop(dropped);
    assert_eq!(bus.observer_count(), 1);

    bus.shutdown();
    assert_eq!(bus.observer_count(), 0);
    assert!(kept.recv().await.is_none());
}
