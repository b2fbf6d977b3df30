//! Worker settings read from `RENDER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use actors::CoordinatorConfig;
use db::DbConfig;
use thiserror::Error;
use webhooks::WebhookConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the worker binary needs to start.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db: DbConfig,
    pub coordinator: CoordinatorConfig,
    pub webhooks: WebhookConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut db = DbConfig::default();
        if let Some(endpoint) = lookup("RENDER_DB_ENDPOINT") {
            db.endpoint = endpoint;
        }
        if let Some(namespace) = lookup("RENDER_DB_NAMESPACE") {
            db = db.with_namespace(namespace);
        }
        if let Some(database) = lookup("RENDER_DB_DATABASE") {
            db = db.with_database(database);
        }
        if let (Some(user), Some(pass)) = (lookup("RENDER_DB_USER"), lookup("RENDER_DB_PASS")) {
            db = db.with_credentials(user, pass);
        }

        let mut coordinator = CoordinatorConfig::default();
        if let Some(worker_id) = lookup("RENDER_WORKER_ID") {
            coordinator = coordinator.with_worker_id(worker_id);
        }
        if let Some(max) = parse::<usize>(&lookup, "RENDER_MAX_CONCURRENT")? {
            if max == 0 {
                return Err(ConfigError::Invalid {
                    name: "RENDER_MAX_CONCURRENT",
                    value: max.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            coordinator = coordinator.with_max_concurrent(max);
        }
        if let Some(ttl) = seconds(&lookup, "RENDER_LEASE_TTL_SECS")? {
            coordinator = coordinator.with_lease_ttl(ttl);
        }
        if let Some(interval) = seconds(&lookup, "RENDER_HEARTBEAT_SECS")? {
            coordinator = coordinator.with_heartbeat_interval(interval);
        }
        if let Some(timeout) = seconds(&lookup, "RENDER_JOB_TIMEOUT_SECS")? {
            coordinator = coordinator.with_job_timeout(timeout);
        }
        if let Some(interval) = seconds(&lookup, "RENDER_RECOVERY_SECS")? {
            let warmup = coordinator.recovery_warmup;
            coordinator = coordinator.with_recovery(warmup, interval);
        }
        if let Some(grace) = seconds(&lookup, "RENDER_SHUTDOWN_GRACE_SECS")? {
            coordinator = coordinator.with_shutdown_grace(grace);
        }

        let mut webhooks = WebhookConfig::default();
        if let Some(urls) = lookup("RENDER_ALERT_URLS") {
            let urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            webhooks = webhooks.with_alert_urls(urls);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "RENDER_WEBHOOK_MAX_ATTEMPTS")? {
            webhooks = webhooks.with_max_attempts(attempts);
        }

        Ok(Self {
            db,
            coordinator,
            webhooks,
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
    }
}

/// Longest accepted interval setting, one year.
const MAX_SECS: u64 = 365 * 24 * 3600;

fn seconds(
    lookup: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(lookup, name)? {
        Some(secs) if secs > MAX_SECS => Err(ConfigError::Invalid {
            name,
            value: secs.to_string(),
            reason: format!("must be at most {}", MAX_SECS),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}
