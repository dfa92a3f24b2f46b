use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

/// Best-effort audit sink. Delivery failures are logged and swallowed.
pub struct AuditWebhook {
    client: Client,
    url: Option<String>,
}

impl AuditWebhook {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            url: Some(url.trim())
                .filter(|u| !u.is_empty())
                .map(|u| u.to_string()),
        })
    }

    pub async fn append(&self, content: &str) {
        let Some(url) = &self.url else {
            debug!("audit webhook disabled; dropping record");
            return;
        };

        let result = self
            .client
            .post(url)
            .json(&json!({ "content": content }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = resp.status().as_u16(), "audit webhook rejected record"),
            Err(e) => warn!(error = %e, "error logging to webhook"),
        }
    }
}
