//! Voxline server binary.
//!
//! Starts the axum HTTP/WebSocket server with structured logging and
//! graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use voxline_server::{app, config, AppState};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VOXLINE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().unwrap_or("config.toml");

    let config = config::load_config(Some(selected_config_path))
        .expect("failed to load configuration, the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path,
        "resolved startup configuration path"
    );

    let state = AppState::from_config(config).await;

    // Sessions build their own agents; probing one here surfaces a bad
    // provider setup at startup instead of on the first call.
    match state.build_agent() {
        Ok(agent) => {
            let stats = agent.stats();
            tracing::info!(
                provider = %stats.provider,
                model = %stats.model,
                tools = ?stats.tool_names,
                "language model configured"
            );
        }
        Err(e) => tracing::warn!("language model not usable, sessions will fail: {}", e),
    }
    if !state.stt.model_path().exists() {
        tracing::warn!(
            path = %state.stt.model_path().display(),
            "whisper model not found, transcription will fail"
        );
    }

    let addr = SocketAddr::new(state.config.server.host, state.config.server.port);
    let app = app(state);

    tracing::info!(%addr, "starting voxline server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("voxline server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
