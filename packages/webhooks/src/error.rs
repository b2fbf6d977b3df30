use db::DbError;
use thiserror::Error;

/// Webhook subsystem errors.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid webhook URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}
