//! Outbound client for the templated endpoints.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("API error: {0}")]
    Api(String),
    #[error("received an error with status: {status}, body: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client })
    }

    /// Issues a single bodiless POST. A 2xx body is returned as-is.
    pub async fn send(&self, url: &str) -> Result<String, UpstreamError> {
        debug!(%url, "upstream request");
        let response = self.client.post(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "upstream returned failure status");
            return Err(match error_field(&body) {
                Some(message) => UpstreamError::Api(message),
                None => UpstreamError::Status {
                    status: status.as_u16(),
                    body,
                },
            });
        }
        Ok(body)
    }
}

fn error_field(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    match parsed.as_object()?.get("error")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
