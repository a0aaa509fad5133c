//! Per-session statistics reported over the API.

use serde::{Deserialize, Serialize};

/// Wall-clock timestamps (milliseconds since the Unix epoch) of the most
/// recent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimings {
    pub transcription_received_at: Option<i64>,
    pub agent_started_at: Option<i64>,
    pub first_token_at: Option<i64>,
    pub first_audio_at: Option<i64>,
}

impl SessionTimings {
    /// Milliseconds between the user turn arriving and the first audio
    /// being sent, when both are known.
    pub fn response_latency_ms(&self) -> Option<i64> {
        match (self.transcription_received_at, self.first_audio_at) {
            (Some(start), Some(audio)) if audio >= start => Some(audio - start),
            _ => None,
        }
    }
}

/// Snapshot of a live voice session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    /// RFC 3339 timestamp of the connection.
    pub connected_at: String,
    pub audio_bytes_received: u64,
    pub utterances: u64,
    pub transcriptions: u64,
    pub turns: u64,
    pub interruptions: u64,
    pub tts_segments: u64,
    pub tool_calls: u64,
    pub current_tool: Option<String>,
    pub timings: SessionTimings,
}
