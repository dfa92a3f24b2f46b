use std::env;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: keygate serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config.json");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match keygate_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    info!(
        config = %config_path,
        endpoints = cfg.api.len(),
        strict_redemption = cfg.strict_redemption,
        "config loaded"
    );

    if let Err(e) = keygate_server::serve(cfg, &config_path).await {
        error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
