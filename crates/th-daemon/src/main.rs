//! termhost daemon -- serves whitelisted terminal apps to browser clients
//! over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use th_bridge::http_api::{api_router, ApiState};
use th_core::config::Config;
use tracing::{error, info};

mod environment;

/// Names an env file to load instead of searching for `.env`.
const ENV_FILE_VAR: &str = "TERMHOST_ENV_FILE";

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = match std::env::var_os(ENV_FILE_VAR) {
        Some(path) => environment::load_dotenv_from(&PathBuf::from(path)),
        None => environment::load_dotenv(),
    };

    let (config, source) = Config::load().context("failed to load configuration")?;
    th_telemetry::logging::init("th-daemon", &config.logging.level, config.logging.json);
    dotenv.log();
    source.log();

    let apps_dir = &config.terminal.apps_directory;
    std::fs::create_dir_all(apps_dir)
        .with_context(|| format!("failed to create apps directory {}", apps_dir.display()))?;

    let available: Vec<&str> = config
        .terminal
        .allowed_apps
        .keys()
        .map(String::as_str)
        .collect();
    info!(
        apps_directory = %apps_dir.display(),
        available_apps = ?available,
        max_concurrent = config.terminal.max_concurrent,
        allowed_origins = ?config.terminal.allowed_origins,
        port = config.server.port,
        "Terminal Backend Server starting"
    );

    let state = Arc::new(ApiState::new(&config.terminal));
    let router = api_router(state);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
