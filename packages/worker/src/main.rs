//! Render worker process.
//!
//! Joins the shared store as one worker, picks up queued render jobs,
//! delivers webhooks and shuts down cleanly on SIGINT/SIGTERM. Producers
//! submit work by writing `queued` jobs to the store; every worker adopts
//! them on its recovery cycle.

mod config;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use actors::{DistributedCoordinator, job_executor};
use notify::{BusConfig, NotificationBus};
use render_core::JobResult;
use tracing_subscriber::EnvFilter;
use webhooks::WebhookDispatcher;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        worker_id = %config.coordinator.registry.worker_id,
        endpoint = %config.db.endpoint,
        max_concurrent = config.coordinator.queue.max_concurrent,
        "Starting render worker"
    );

    let store = db::open(config.db.clone()).await?;

    let bus = NotificationBus::new(BusConfig::default());
    bus.start();

    let webhooks = WebhookDispatcher::new(store.webhooks.clone(), config.webhooks.clone())?;
    webhooks.start();

    // Demo renderer: waits `render_ms` and reports where the chart would land.
    let executor = Arc::new(job_executor!(|job| {
        if job.payload.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Err(format!("Renderer rejected {} {}", job.symbol, job.timeframe));
        }
        let render_ms = job
            .payload
            .get("render_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(500);
        tracing::info!(job_id = %job.id, symbol = %job.symbol, "Rendering chart");
        tokio::time::sleep(Duration::from_millis(render_ms)).await;
        Ok(JobResult::with_output(
            format!("Rendered {} {}", job.symbol, job.timeframe),
            serde_json::json!({
                "artifact": format!("charts/{}/{}/{}.png", job.symbol, job.timeframe, job.id),
            }),
        ))
    }));

    let coordinator = DistributedCoordinator::builder(store, config.coordinator.clone(), executor)
        .with_bus(bus.clone())
        .with_webhooks(webhooks.clone())
        .start()
        .await?;

    let shutdown = shutdown::install_shutdown_handler()?;
    shutdown.cancelled().await;

    if let Err(e) = coordinator.shutdown().await {
        tracing::error!("Coordinator shutdown failed: {}", e);
    }
    // One last pass so terminal events queued during shutdown go out.
    if let Err(e) = webhooks.process_pending_webhooks().await {
        tracing::warn!("Final webhook pass failed: {}", e);
    }
    webhooks.stop();
    bus.shutdown();

    tracing::info!("Render worker stopped");
    Ok(())
}
