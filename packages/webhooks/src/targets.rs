//! Target URL resolution for job events.

use render_core::Job;
use url::Url;

use crate::WebhookError;

/// Check that a target is an absolute http(s) URL.
pub fn validate_url(raw: &str) -> Result<Url, WebhookError> {
    let invalid = |reason: String| WebhookError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Every distinct, valid target configured for a job.
///
/// Targets come from `job.webhook_urls` and from a `webhook_url` string or
/// `webhook_urls` array in the payload. Invalid entries are logged and dropped.
pub fn resolve_targets(job: &Job) -> Vec<String> {
    let mut raw: Vec<String> = job.webhook_urls.clone();

    if let Some(url) = job.payload.get("webhook_url").and_then(|v| v.as_str()) {
        raw.push(url.to_string());
    }
    if let Some(urls) = job.payload.get("webhook_urls").and_then(|v| v.as_array()) {
        raw.extend(urls.iter().filter_map(|v| v.as_str()).map(str::to_string));
    }

    let mut targets: Vec<String> = Vec::new();
    for candidate in raw {
        match validate_url(&candidate) {
            Ok(url) => {
                let url = url.to_string();
                if !targets.contains(&url) {
                    targets.push(url);
                }
            }
            Err(e) => tracing::warn!(job_id = %job.id, "Ignoring webhook target: {}", e),
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_http_targets() {
        assert!(validate_url("https://hooks.example.com/render").is_ok());
        assert!(validate_url("http://127.0.0.1:8080/cb").is_ok());
        assert!(validate_url("ftp://example.com/drop").is_err());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn merges_job_and_payload_targets() {
        let job = Job::new(
            "BTCUSD",
            "1h",
            json!({
                "webhook_url": "https://a.example.com/hook",
                "webhook_urls": ["https://b.example.com/hook", "javascript:alert(1)", 7],
            }),
        )
        .with_webhook("https://a.example.com/hook")
        .with_webhook("https://c.example.com/hook");

        assert_eq!(
            resolve_targets(&job),
            vec![
                "https://a.example.com/hook".to_string(),
                "https://c.example.com/hook".to_string(),
                "https://b.example.com/hook".to_string(),
            ]
        );
    }

    #[test]
    fn job_without_targets_resolves_empty() {
        let job = Job::new("ETHUSD", "4h", json!({ "theme": "light" }));
        assert!(resolve_targets(&job).is_empty());
    }
}
