//! Per-caller voice sessions and the registry of live ones.
//!
//! A session owns the caller's audio pipeline and two kinds of background
//! jobs: transcriptions and responses. Both are plain tokio tasks kept by
//! handle so a caller who starts talking again can cut them off.

use crate::api_ws::{ClientMessage, Outbound, ServerMessage};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use voxline_agent::{is_exit_command, AgentEvent, VoiceAgent};
use voxline_types::{SessionStats, SessionTimings};
use voxline_voice::{
    AudioInputProcessor, SpeechSegmenter, SttService, TtsService, TurnEvent, VadConfig,
    STT_SAMPLE_RATE,
};

/// Agent events buffered between the model stream and speech synthesis.
const AGENT_EVENT_BUFFER: usize = 64;

/// Stats handle shared between a session, its tasks and the registry.
pub type SharedStats = Arc<Mutex<SessionStats>>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn update_stats<R>(stats: &SharedStats, f: impl FnOnce(&mut SessionStats) -> R) -> R {
    let mut guard = stats.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

/// Tracks live sessions and enforces the concurrency limit.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SharedStats>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Registers a session. Returns `false` when the registry is full.
    pub async fn add(&self, id: Uuid, stats: SharedStats) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return false;
        }
        sessions.insert(id, stats);
        true
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_full(&self) -> bool {
        self.count().await >= self.max_sessions
    }

    /// Stats of every live session, oldest first.
    pub async fn snapshot(&self) -> Vec<SessionStats> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<SessionStats> = sessions
            .values()
            .map(|s| update_stats(s, |stats| stats.clone()))
            .collect();
        all.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        all
    }
}

/// What a session needs from the outside world. Cloned into every
/// response job.
#[derive(Clone)]
pub struct SessionContext {
    pub agent: Arc<tokio::sync::Mutex<VoiceAgent>>,
    pub stt: Arc<SttService>,
    pub tts: Arc<TtsService>,
    /// TTS profile id.
    pub voice: String,
    pub stats: SharedStats,
    pub out: mpsc::Sender<Outbound>,
}

impl SessionContext {
    /// Queues a message for the client. A closed socket is not an error here;
    /// the session loop notices it on its own.
    pub async fn send(&self, message: ServerMessage) {
        let _ = self.out.send(Outbound::Json(message)).await;
    }

    async fn send_audio(&self, pcm: Vec<u8>) {
        let _ = self.out.send(Outbound::Audio(pcm)).await;
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionStats) -> R) -> R {
        update_stats(&self.stats, f)
    }
}

/// A transcript tagged with the barge-in generation it was started in.
#[derive(Debug)]
pub struct Transcript {
    generation: u64,
    text: String,
    /// Interim text of an utterance still in progress.
    partial: bool,
}

/// Transcript of audio cut off a long turn, resolved once.
type CarriedText = Shared<BoxFuture<'static, String>>;

/// Whether the connection should stay open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Close,
}

pub struct VoiceSession {
    id: Uuid,
    ctx: SessionContext,
    input: AudioInputProcessor,
    vad: VadConfig,
    transcripts: mpsc::Sender<Transcript>,
    /// Bumped on every barge-in; transcripts from older generations are stale.
    generation: u64,
    transcription: Option<JoinHandle<()>>,
    partial: Option<JoinHandle<()>>,
    /// Leading pieces of the current turn, in order.
    carried: Vec<CarriedText>,
    response: Option<JoinHandle<()>>,
}

impl VoiceSession {
    pub fn new(
        id: Uuid,
        ctx: SessionContext,
        input: AudioInputProcessor,
        vad: VadConfig,
        transcripts: mpsc::Sender<Transcript>,
    ) -> Self {
        Self {
            id,
            ctx,
            input,
            vad,
            transcripts,
            generation: 0,
            transcription: None,
            partial: None,
            carried: Vec::new(),
            response: None,
        }
    }

    pub async fn send(&self, message: ServerMessage) {
        self.ctx.send(message).await;
    }

    pub fn stats_snapshot(&self) -> SessionStats {
        self.ctx.update(|s| s.clone())
    }

    /// Feeds caller audio through the turn detector and reacts to turn events.
    pub async fn handle_audio(&mut self, bytes: &[u8]) {
        self.ctx
            .update(|s| s.audio_bytes_received += bytes.len() as u64);

        let events = match self.input.feed(bytes) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "audio processing failed: {}", e);
                self.send(ServerMessage::Error {
                    message: format!("Audio processing failed: {}", e),
                })
                .await;
                return;
            }
        };

        for event in events {
            match event {
                TurnEvent::SpeechStarted => {
                    tracing::debug!(session_id = %self.id, "speech started");
                    self.carried.clear();
                    self.barge_in().await;
                    self.send(ServerMessage::SpeechStarted).await;
                }
                TurnEvent::SpeechResumed => {
                    tracing::debug!(session_id = %self.id, "speech resumed, dropping early transcript");
                    self.barge_in().await;
                }
                TurnEvent::UtteranceReady { samples } => {
                    self.ctx.update(|s| s.utterances += 1);
                    self.start_transcription(samples);
                }
                TurnEvent::UtteranceCut { samples } => {
                    tracing::debug!(session_id = %self.id, "long utterance cut, turn continues");
                    self.ctx.update(|s| s.utterances += 1);
                    self.carry_transcription(samples);
                }
                TurnEvent::UtterancePartial { samples } => {
                    self.start_partial(samples);
                }
                TurnEvent::UtteranceEnded => {
                    tracing::debug!(session_id = %self.id, "utterance ended");
                }
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Control {
        match message {
            ClientMessage::Config {
                sample_rate,
                channels,
            } => {
                let rate = sample_rate.unwrap_or(self.input.source_sample_rate());
                let channels = channels.unwrap_or(self.input.source_channels());
                match AudioInputProcessor::new(rate, channels, self.vad.clone()) {
                    Ok(input) => {
                        tracing::info!(session_id = %self.id, rate, channels, "audio input reconfigured");
                        self.input = input;
                    }
                    Err(e) => {
                        self.send(ServerMessage::Error {
                            message: format!("Invalid audio format: {}", e),
                        })
                        .await;
                    }
                }
                Control::Continue
            }
            ClientMessage::Text { content } => {
                let content = content.trim().to_string();
                if content.is_empty() {
                    self.send(ServerMessage::Error {
                        message: "Empty text message".to_string(),
                    })
                    .await;
                    return Control::Continue;
                }
                self.submit_turn(content).await
            }
            ClientMessage::Interrupt => {
                self.barge_in().await;
                Control::Continue
            }
            ClientMessage::ClearHistory => {
                if self.cancel_response() {
                    self.send(ServerMessage::StopPlayback).await;
                }
                self.ctx.agent.lock().await.clear_history();
                tracing::info!(session_id = %self.id, "conversation history cleared");
                Control::Continue
            }
            ClientMessage::Stats => {
                let agent = self.ctx.agent.try_lock().ok().map(|agent| agent.stats());
                self.send(ServerMessage::Stats {
                    session: self.stats_snapshot(),
                    agent,
                    stt: self.ctx.stt.stats(),
                    tts: self.ctx.tts.stats(),
                })
                .await;
                Control::Continue
            }
        }
    }

    /// Turns a finished transcription into a user turn unless the caller
    /// has spoken since it started.
    pub async fn handle_transcript(&mut self, transcript: Transcript) -> Control {
        if transcript.generation != self.generation {
            tracing::debug!(session_id = %self.id, "dropping stale transcript");
            return Control::Continue;
        }
        if transcript.partial {
            if self.transcription.is_some() {
                return Control::Continue;
            }
            self.send(ServerMessage::TranscriptionPartial {
                text: transcript.text,
            })
            .await;
            return Control::Continue;
        }
        self.transcription = None;
        self.carried.clear();
        self.ctx.update(|s| s.transcriptions += 1);
        tracing::info!(session_id = %self.id, text = %transcript.text, "transcription");
        self.send(ServerMessage::Transcription {
            text: transcript.text.clone(),
        })
        .await;
        self.submit_turn(transcript.text).await
    }

    /// Aborts background work. Called when the connection ends.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.transcription.take() {
            handle.abort();
        }
        if let Some(handle) = self.partial.take() {
            handle.abort();
        }
        self.carried.clear();
        if let Some(handle) = self.response.take() {
            handle.abort();
        }
    }

    /// Stops whatever the agent is doing because the caller took the floor.
    async fn barge_in(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.transcription.take() {
            handle.abort();
        }
        if let Some(handle) = self.partial.take() {
            handle.abort();
        }
        self.cancel_response();
        self.send(ServerMessage::StopPlayback).await;
    }

    /// Aborts the running response, if any. Returns whether one was running.
    fn cancel_response(&mut self) -> bool {
        match self.response.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                self.ctx.update(|s| {
                    s.interruptions += 1;
                    s.current_tool = None;
                });
                tracing::info!(session_id = %self.id, "response interrupted");
                true
            }
            _ => false,
        }
    }

    /// Transcribes the utterance and hands the whole turn's text, carried
    /// pieces first, back to the session loop.
    fn start_transcription(&mut self, samples: Vec<i16>) {
        if let Some(handle) = self.transcription.take() {
            handle.abort();
        }
        if let Some(handle) = self.partial.take() {
            handle.abort();
        }

        let stt = self.ctx.stt.clone();
        let out = self.ctx.out.clone();
        let transcripts = self.transcripts.clone();
        let carried = self.carried.clone();
        let generation = self.generation;
        let session_id = self.id;
        self.transcription = Some(tokio::spawn(async move {
            let mut parts = join_all(carried).await;
            parts.push(transcribe_or_report(&stt, &out, &samples, session_id).await);
            let text = parts
                .iter()
                .filter(|p| !p.is_empty())
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            if text.is_empty() {
                tracing::debug!(session_id = %session_id, "empty transcript");
                return;
            }
            let _ = transcripts
                .send(Transcript {
                    generation,
                    text,
                    partial: false,
                })
                .await;
        }));
    }

    /// Starts transcribing a piece cut off a turn that is still going.
    fn carry_transcription(&mut self, samples: Vec<i16>) {
        if let Some(handle) = self.partial.take() {
            handle.abort();
        }
        let stt = self.ctx.stt.clone();
        let out = self.ctx.out.clone();
        let session_id = self.id;
        let handle = tokio::spawn(async move {
            transcribe_or_report(&stt, &out, &samples, session_id).await
        });
        self.carried
            .push(async move { handle.await.unwrap_or_default() }.boxed().shared());
    }

    /// Interim transcript while the caller is still talking. Skipped while
    /// the previous one is still running.
    fn start_partial(&mut self, samples: Vec<i16>) {
        if self.partial.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let stt = self.ctx.stt.clone();
        let transcripts = self.transcripts.clone();
        let generation = self.generation;
        let session_id = self.id;
        self.partial = Some(tokio::spawn(async move {
            match stt.transcribe(&samples, STT_SAMPLE_RATE).await {
                Ok(text) => {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        let _ = transcripts
                            .send(Transcript {
                                generation,
                                text,
                                partial: true,
                            })
                            .await;
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, "interim transcription failed: {}", e);
                }
            }
        }));
    }

    async fn submit_turn(&mut self, text: String) -> Control {
        if self.cancel_response() {
            self.send(ServerMessage::StopPlayback).await;
        }

        if is_exit_command(&text) {
            tracing::info!(session_id = %self.id, "exit command received");
            self.send(ServerMessage::Goodbye).await;
            return Control::Close;
        }

        self.ctx.update(|s| {
            s.turns += 1;
            s.current_tool = None;
            s.timings = SessionTimings {
                transcription_received_at: Some(now_ms()),
                ..SessionTimings::default()
            };
        });
        self.response = Some(tokio::spawn(run_response(self.ctx.clone(), self.id, text)));
        Control::Continue
    }
}

/// Trimmed transcript of `samples`, or empty after reporting the failure
/// to the client.
async fn transcribe_or_report(
    stt: &SttService,
    out: &mpsc::Sender<Outbound>,
    samples: &[i16],
    session_id: Uuid,
) -> String {
    match stt.transcribe(samples, STT_SAMPLE_RATE).await {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            tracing::warn!(session_id = %session_id, "transcription failed: {}", e);
            let _ = out
                .send(Outbound::Json(ServerMessage::Error {
                    message: format!("Transcription failed: {}", e),
                }))
                .await;
            String::new()
        }
    }
}

/// Streams one answer to the client: text as it is generated and audio per
/// completed sentence.
async fn run_response(ctx: SessionContext, session_id: Uuid, text: String) {
    let mut agent = ctx.agent.lock().await;
    ctx.update(|s| s.timings.agent_started_at = Some(now_ms()));

    let (events_tx, mut events_rx) = mpsc::channel(AGENT_EVENT_BUFFER);
    let respond = async move {
        let answer = agent.respond(&text, &events_tx).await;
        drop(events_tx);
        answer
    };

    let speak = async {
        let mut segmenter = SpeechSegmenter::default();
        let mut sequence = 0u64;
        while let Some(event) = events_rx.recv().await {
            match event {
                AgentEvent::Token(token) => {
                    ctx.update(|s| {
                        s.current_tool = None;
                        s.timings.first_token_at.get_or_insert_with(now_ms);
                    });
                    ctx.send(ServerMessage::TextChunk {
                        content: token.clone(),
                    })
                    .await;
                    for segment in segmenter.push(&token) {
                        speak_segment(&ctx, &segment, &mut sequence).await;
                    }
                }
                AgentEvent::ToolStarted { name } => {
                    ctx.update(|s| {
                        s.tool_calls += 1;
                        s.current_tool = Some(name.clone());
                    });
                    ctx.send(ServerMessage::ToolStart { name }).await;
                }
            }
        }
        if let Some(rest) = segmenter.finish() {
            speak_segment(&ctx, &rest, &mut sequence).await;
        }
        sequence
    };

    let (answer, chunks) = tokio::join!(respond, speak);

    let timings = ctx.update(|s| {
        s.current_tool = None;
        s.timings.clone()
    });
    ctx.send(ServerMessage::StreamEnd { chunks }).await;

    let since_turn = |at: Option<i64>| {
        at.zip(timings.transcription_received_at)
            .map(|(at, start)| at - start)
    };
    tracing::info!(
        session_id = %session_id,
        answer_chars = answer.chars().count(),
        chunks,
        agent_start_ms = ?since_turn(timings.agent_started_at),
        first_token_ms = ?since_turn(timings.first_token_at),
        response_latency_ms = ?timings.response_latency_ms(),
        "turn complete"
    );
}

async fn speak_segment(ctx: &SessionContext, text: &str, sequence: &mut u64) {
    match ctx.tts.synthesize(text, &ctx.voice).await {
        Ok(audio) if audio.pcm.is_empty() => {
            tracing::debug!(text, "synthesizer produced no audio");
        }
        Ok(audio) => {
            ctx.update(|s| {
                s.tts_segments += 1;
                s.timings.first_audio_at.get_or_insert_with(now_ms);
            });
            ctx.send(ServerMessage::Audio {
                sample_rate: audio.sample_rate,
                sequence: *sequence,
                text: text.to_string(),
            })
            .await;
            ctx.send_audio(audio.pcm).await;
            *sequence += 1;
        }
        Err(e) => {
            tracing::warn!(voice = %ctx.voice, "speech synthesis failed: {}", e);
            ctx.send(ServerMessage::Error {
                message: format!("Speech synthesis failed: {}", e),
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn session_can_be_held_across_awaits() {
        assert_send_sync::<VoiceSession>();
        assert_send_sync::<SessionContext>();
    }

    fn stats(id: &str, connected_at: &str) -> SharedStats {
        Arc::new(Mutex::new(SessionStats {
            session_id: id.to_string(),
            connected_at: connected_at.to_string(),
            ..SessionStats::default()
        }))
    }

    #[tokio::test]
    async fn registry_enforces_limit() {
        let registry = SessionRegistry::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(registry.add(a, stats("a", "2026-01-01T00:00:02Z")).await);
        assert!(registry.add(b, stats("b", "2026-01-01T00:00:01Z")).await);
        assert!(registry.is_full().await);
        assert!(!registry.add(c, stats("c", "2026-01-01T00:00:03Z")).await);
        assert_eq!(registry.count().await, 2);

        let ids: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(registry.remove(&a).await);
        assert!(!registry.remove(&a).await);
        assert!(registry.add(c, stats("c", "2026-01-01T00:00:03Z")).await);
    }

    #[tokio::test]
    async fn snapshot_reflects_live_updates() {
        let registry = SessionRegistry::new(4);
        let handle = stats("s", "2026-01-01T00:00:00Z");
        registry.add(Uuid::new_v4(), handle.clone()).await;

        update_stats(&handle, |s| s.turns = 3);
        assert_eq!(registry.snapshot().await[0].turns, 3);
    }
}
