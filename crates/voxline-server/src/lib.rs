//! Voxline server library logic.

pub mod api_ws;
pub mod config;
pub mod session;

use axum::{extract::DefaultBodyLimit, routing::get, Extension, Json, Router};
use config::Config;
use serde_json::{json, Value};
use session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use voxline_agent::{
    available_providers, common_models, default_model, AgentError, LlmClient, ToolRegistry,
    VoiceAgent,
};
use voxline_types::LlmProvider;
use voxline_voice::{SttService, TtsService};

/// Maximum request body size (2 MiB). Protects against OOM from oversized payloads.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Validated startup configuration.
    pub config: Arc<Config>,
    /// Speech recognition, shared by all sessions.
    pub stt: Arc<SttService>,
    /// Speech synthesis with the configured voice profiles.
    pub tts: Arc<TtsService>,
    /// Live voice sessions.
    pub sessions: SessionRegistry,
}

impl AppState {
    /// Builds the speech services and registers the voice profiles.
    pub async fn from_config(config: Config) -> Self {
        let stt = SttService::new(
            &config.stt.binary_path,
            config.stt.resolved_model_path(),
            &config.stt.language,
            Duration::from_secs(config.stt.timeout_secs),
        );

        let tts = TtsService::new(
            &config.tts.voices_dir,
            &config.tts.piper_binary,
            Duration::from_secs(config.tts.timeout_secs),
        );
        for profile in config.tts.effective_profiles() {
            tracing::debug!(id = %profile.id, model = ?profile.model, "registering voice profile");
            tts.add_profile(profile).await;
        }

        Self {
            sessions: SessionRegistry::new(config.session.max_sessions),
            stt: Arc::new(stt),
            tts: Arc::new(tts),
            config: Arc::new(config),
        }
    }

    /// A fresh agent for one conversation.
    pub fn build_agent(&self) -> Result<VoiceAgent, AgentError> {
        build_agent(&self.config)
    }
}

/// Builds an agent with the built-in tools from the `[llm]` settings.
pub fn build_agent(config: &Config) -> Result<VoiceAgent, AgentError> {
    let client = LlmClient::from_settings(&config.llm.to_settings())?;
    let mut agent = VoiceAgent::new(client, ToolRegistry::with_mock_tools())
        .with_max_history_turns(config.llm.max_history_turns)
        .with_max_tool_rounds(config.llm.max_tool_rounds);
    if let Some(prompt) = &config.llm.system_prompt {
        agent = agent.with_system_prompt(prompt.clone());
    }
    Ok(agent)
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "voxline",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.sessions.count().await,
    }))
}

/// Service description.
async fn root(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let llm = &state.config.llm;
    Json(json!({
        "service": "voxline",
        "description": "Real-time voice agent: speech in, streamed speech out",
        "version": env!("CARGO_PKG_VERSION"),
        "websocketUrl": "/voice",
        "llm": {
            "provider": llm.provider,
            "model": llm.to_settings().resolved_model(),
        },
        "endpoints": {
            "health": "/health",
            "providers": "/api/providers",
            "tools": "/api/tools",
            "sessions": "/api/sessions",
            "voice": "/voice",
        },
    }))
}

/// `GET /api/providers`: supported providers and their models.
async fn providers(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let llm = &state.config.llm;
    let providers: Vec<Value> = available_providers()
        .into_iter()
        .filter_map(|name| name.parse::<LlmProvider>().ok())
        .map(|provider| {
            json!({
                "name": provider.as_str(),
                "defaultModel": default_model(provider),
                "models": common_models(provider),
            })
        })
        .collect();
    Json(json!({
        "current": {
            "provider": llm.provider,
            "model": llm.to_settings().resolved_model(),
        },
        "providers": providers,
    }))
}

/// `GET /api/tools`: tools offered to the model.
async fn tools() -> Json<Value> {
    Json(json!({ "tools": ToolRegistry::with_mock_tools().specs() }))
}

/// `GET /api/sessions`: live session stats.
async fn sessions(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let sessions = state.sessions.snapshot().await;
    Json(json!({
        "count": sessions.len(),
        "maxSessions": state.sessions.max_sessions(),
        "sessions": sessions,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/providers", get(providers))
        .route("/api/tools", get(tools))
        .route("/api/sessions", get(sessions))
        .route("/voice", get(api_ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
