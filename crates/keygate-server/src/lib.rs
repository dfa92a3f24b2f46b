use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use keygate_config::Config;
use keygate_contracts::{command_surface, DispatchOutcome, InboundMessage};
use serde_json::{json, Value};
use tracing::{info, warn};

pub mod audit;
pub mod dispatcher;
pub mod key_store;
pub mod platform;
pub mod upstream;

use audit::AuditWebhook;
use dispatcher::Dispatcher;
use key_store::KeyStore;
use platform::PlatformClient;
use upstream::UpstreamClient;

pub async fn serve(cfg: Config, config_path: impl Into<PathBuf>) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listenAddr: {e}"))?;

    let app = build_app(cfg, config_path).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "keygate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config, config_path: impl Into<PathBuf>) -> Result<Router, String> {
    let state = AppState::new(cfg, config_path.into()).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/messages", post(messages))
        .route("/v1/contracts", get(contracts))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    platform: Arc<PlatformClient>,
    audit: Arc<AuditWebhook>,
}

impl AppState {
    async fn new(cfg: Config, config_path: PathBuf) -> Result<Self, String> {
        let timeout = Duration::from_millis(cfg.request_timeout_ms);
        let platform = Arc::new(PlatformClient::new(
            &cfg.discord_api_base,
            &cfg.bot_token,
            timeout,
        )?);

        let bot_user_id = match &cfg.bot_user_id {
            Some(id) => id.clone(),
            None => platform
                .current_user_id()
                .await
                .map_err(|e| format!("resolve bot identity failed: {e}"))?,
        };
        info!(bot_user_id = %bot_user_id, issued_keys = cfg.keys.len(), "bot identity resolved");

        let keys = Arc::new(KeyStore::new(config_path, cfg.clone()));
        let audit = Arc::new(AuditWebhook::new(&cfg.webhook_url, timeout)?);
        let upstream = UpstreamClient::new(timeout)?;

        Ok(Self {
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(cfg),
                Some(bot_user_id),
                keys,
                upstream,
                platform.clone(),
            )),
            platform,
            audit,
        })
    }

    async fn process_message(&self, msg: InboundMessage) -> Result<DispatchOutcome, String> {
        validate_message(&msg)?;

        let outcome = self.dispatcher.dispatch(&msg).await;

        for reply in &outcome.replies {
            if let Err(e) = self.platform.send_message(&msg.channel_id, reply).await {
                warn!(channel_id = %msg.channel_id, error = %e, "reply delivery failed");
            }
        }
        if let Some(record) = &outcome.audit {
            self.audit.append(record).await;
        }
        Ok(outcome)
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    Json(command_surface())
}

async fn messages(
    State(state): State<AppState>,
    Json(msg): Json<InboundMessage>,
) -> Result<Json<DispatchOutcome>, (StatusCode, Json<Value>)> {
    state.process_message(msg).await.map(Json).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"code":"validation_error","message": e}})),
        )
    })
}

fn validate_message(msg: &InboundMessage) -> Result<(), String> {
    if msg.guild_id.is_empty() || msg.channel_id.is_empty() || msg.author.id.is_empty() {
        return Err("guild_id, channel_id, author.id are required".to_string());
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "install ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
