use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// Default reqwest client has no overall timeout. A stalled vendor API would
/// otherwise hang a batch unit forever.
pub fn build_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build vendor HTTP client")
}

/// Reads the body as JSON, turning non-2xx answers into errors that carry
/// the vendor's status and payload.
pub async fn json_or_error(
    vendor: &str,
    action: &str,
    resp: Response,
) -> Result<serde_json::Value> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow::anyhow!(
            "{} {} failed: status={} body={}",
            vendor,
            action,
            status.as_u16(),
            text
        ));
    }
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&text)
        .with_context(|| format!("{} {} returned invalid JSON: {}", vendor, action, text))
}

/// Like [`json_or_error`], but a 404 means the resource is gone: `Ok(None)`.
pub async fn json_or_missing(
    vendor: &str,
    action: &str,
    resp: Response,
) -> Result<Option<serde_json::Value>> {
    if resp.status() == StatusCode::NOT_FOUND {
        tracing::debug!("[{} API] {} not found", vendor, action);
        return Ok(None);
    }
    json_or_error(vendor, action, resp).await.map(Some)
}

pub fn str_field(v: &serde_json::Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|x| x.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
