//! WebSocket voice endpoint and its wire protocol.

use crate::session::{Control, SessionContext, VoiceSession};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use uuid::Uuid;
use voxline_agent::AgentStats;
use voxline_types::SessionStats;
use voxline_voice::{AudioInputProcessor, SttStats, TtsStats};

/// Time allowed for queued frames to drain after a session ends.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transcripts waiting to become user turns.
const TRANSCRIPT_BUFFER: usize = 8;

/// Query parameters for the voice connection.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConnectParams {
    /// Caller sample rate; defaults to `session.input_sample_rate`.
    pub sample_rate: Option<u32>,
    /// Caller channel count; defaults to `session.input_channels`.
    pub channels: Option<u16>,
    /// TTS profile id; defaults to `tts.default_profile`.
    pub voice: Option<String>,
}

/// Incoming WebSocket control messages. Audio arrives as binary frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Renegotiates the caller audio format.
    Config {
        #[serde(rename = "sampleRate")]
        sample_rate: Option<u32>,
        channels: Option<u16>,
    },
    /// A typed user turn.
    Text { content: String },
    /// Stops the current answer without speaking.
    Interrupt,
    ClearHistory,
    Stats,
}

/// Outgoing WebSocket messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        tools: Vec<String>,
        model: String,
    },
    SpeechStarted,
    Transcription {
        text: String,
    },
    /// Interim text while the caller is still talking.
    TranscriptionPartial {
        text: String,
    },
    TextChunk {
        content: String,
    },
    ToolStart {
        name: String,
    },
    /// Header for the binary PCM frame that follows it.
    Audio {
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        sequence: u64,
        text: String,
    },
    StreamEnd {
        chunks: u64,
    },
    StopPlayback,
    Stats {
        session: SessionStats,
        /// Absent while the agent is busy answering.
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentStats>,
        stt: SttStats,
        tts: TtsStats,
    },
    Goodbye,
    Error {
        message: String,
    },
}

/// A frame queued for the socket writer.
#[derive(Debug)]
pub enum Outbound {
    Json(ServerMessage),
    Audio(Vec<u8>),
}

/// `GET /voice`: upgrades to a duplex voice session.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<VoiceConnectParams>,
) -> impl IntoResponse {
    if state.sessions.is_full().await {
        tracing::warn!(remote_addr = %addr, "rejecting voice session: session limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many active sessions").into_response();
    }

    if params.sample_rate == Some(0) || params.channels == Some(0) {
        return (
            StatusCode::BAD_REQUEST,
            "sample_rate and channels must be greater than 0",
        )
            .into_response();
    }

    let voice = params
        .voice
        .clone()
        .unwrap_or_else(|| state.config.tts.default_profile.clone());
    if state.tts.get_profile(&voice).await.is_none() {
        tracing::warn!(remote_addr = %addr, voice = %voice, "unknown voice profile requested");
        return (StatusCode::BAD_REQUEST, format!("unknown voice profile: {}", voice))
            .into_response();
    }

    let sample_rate = params
        .sample_rate
        .unwrap_or(state.config.session.input_sample_rate);
    let channels = params
        .channels
        .unwrap_or(state.config.session.input_channels);

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, sample_rate, channels, voice))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    addr: SocketAddr,
    sample_rate: u32,
    channels: u16,
    voice: String,
) {
    let session_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Bounded so a slow client applies backpressure to synthesis instead of
    // growing memory.
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.session.outbound_buffer);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Outbound::Json(message) => match serde_json::to_string(&message) {
                    Ok(json) => AxumMessage::Text(json.into()),
                    Err(e) => {
                        tracing::warn!("failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                Outbound::Audio(pcm) => AxumMessage::Binary(pcm.into()),
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let stats = Arc::new(Mutex::new(SessionStats {
        session_id: session_id.to_string(),
        connected_at: chrono::Utc::now().to_rfc3339(),
        ..SessionStats::default()
    }));

    if !state.sessions.add(session_id, stats.clone()).await {
        reject(tx, send_task, "Too many active sessions".to_string()).await;
        return;
    }

    let agent = match state.build_agent() {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(session_id = %session_id, "failed to create agent: {}", e);
            state.sessions.remove(&session_id).await;
            reject(tx, send_task, format!("Agent unavailable: {}", e)).await;
            return;
        }
    };

    let input = match AudioInputProcessor::new(sample_rate, channels, state.config.vad.clone()) {
        Ok(input) => input,
        Err(e) => {
            state.sessions.remove(&session_id).await;
            reject(tx, send_task, format!("Invalid audio format: {}", e)).await;
            return;
        }
    };

    let agent_stats = agent.stats();
    let ctx = SessionContext {
        agent: Arc::new(tokio::sync::Mutex::new(agent)),
        stt: state.stt.clone(),
        tts: state.tts.clone(),
        voice,
        stats,
        out: tx.clone(),
    };
    let (transcripts_tx, mut transcripts_rx) = mpsc::channel(TRANSCRIPT_BUFFER);
    let mut session = VoiceSession::new(
        session_id,
        ctx,
        input,
        state.config.vad.clone(),
        transcripts_tx,
    );

    tracing::info!(
        session_id = %session_id,
        remote_addr = %addr,
        sample_rate,
        channels,
        model = %agent_stats.model,
        "voice session started"
    );
    session
        .send(ServerMessage::SessionStarted {
            session_id: session_id.to_string(),
            tools: agent_stats.tool_names,
            model: agent_stats.model,
        })
        .await;

    loop {
        let control = tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(AxumMessage::Binary(bytes))) => {
                    session.handle_audio(&bytes).await;
                    Control::Continue
                }
                Some(Ok(AxumMessage::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => session.handle_message(message).await,
                        Err(e) => {
                            session
                                .send(ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                })
                                .await;
                            Control::Continue
                        }
                    }
                }
                Some(Ok(AxumMessage::Close(_))) | None => Control::Close,
                Some(Ok(_)) => Control::Continue,
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, "websocket receive error: {}", e);
                    Control::Close
                }
            },
            Some(transcript) = transcripts_rx.recv() => session.handle_transcript(transcript).await,
        };
        if control == Control::Close {
            break;
        }
    }

    session.shutdown();
    let final_stats = session.stats_snapshot();
    state.sessions.remove(&session_id).await;
    drop(session);
    drop(tx);
    let _ = tokio::time::timeout(SEND_DRAIN_TIMEOUT, send_task).await;

    tracing::info!(
        session_id = %session_id,
        turns = final_stats.turns,
        interruptions = final_stats.interruptions,
        audio_bytes = final_stats.audio_bytes_received,
        "voice session closed"
    );
}

/// Reports a setup failure to the client and closes the connection.
async fn reject(
    tx: mpsc::Sender<Outbound>,
    send_task: tokio::task::JoinHandle<()>,
    message: String,
) {
    let _ = tx.send(Outbound::Json(ServerMessage::Error { message })).await;
    drop(tx);
    let _ = tokio::time::timeout(SEND_DRAIN_TIMEOUT, send_task).await;
}
