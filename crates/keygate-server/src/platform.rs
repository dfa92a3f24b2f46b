//! REST calls against the chat platform, authenticated with the bot token.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
struct GuildMember {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    id: String,
}

pub struct PlatformClient {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl PlatformClient {
    pub fn new(base_url: &str, bot_token: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Bot {bot_token}"),
        })
    }

    /// Fetches the caller's current role set. Never cached.
    pub async fn member_roles(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, PlatformError> {
        let resp = self
            .client
            .get(format!("{}/guilds/{guild_id}/members/{user_id}", self.base_url))
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let member: GuildMember = ensure_success(resp).await?.json().await?;
        Ok(member.roles)
    }

    pub async fn add_member_role(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<(), PlatformError> {
        let resp = self
            .client
            .put(format!(
                "{}/guilds/{guild_id}/members/{user_id}/roles/{role_id}",
                self.base_url
            ))
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        ensure_success(resp).await?;
        debug!(guild_id, user_id, role_id, "role granted");
        Ok(())
    }

    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .post(format!("{}/channels/{channel_id}/messages", self.base_url))
            .header("Authorization", &self.auth_header)
            .json(&json!({ "content": content }))
            .send()
            .await?;
        ensure_success(resp).await?;
        Ok(())
    }

    pub async fn current_user_id(&self) -> Result<String, PlatformError> {
        let resp = self
            .client
            .get(format!("{}/users/@me", self.base_url))
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let user: CurrentUser = ensure_success(resp).await?.json().await?;
        Ok(user.id)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, PlatformError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable>".to_string());
    warn!(status = status.as_u16(), "platform call failed");
    Err(PlatformError::Api {
        status: status.as_u16(),
        body,
    })
}
