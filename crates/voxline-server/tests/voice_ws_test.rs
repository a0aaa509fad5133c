mod common;

use common::{
    slow_transcriber, spawn_mock_ollama, spawn_server, spawn_slow_ollama, test_config, MOCK_PCM,
    MOCK_TRANSCRIPT,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum Frame {
    Json(Value),
    Binary(Vec<u8>),
}

impl Frame {
    fn kind(&self) -> Option<&str> {
        match self {
            Frame::Json(v) => v["type"].as_str(),
            Frame::Binary(_) => None,
        }
    }
}

async fn connect(addr: SocketAddr, query: &str) -> (Client, Value) {
    let url = format!("ws://{}/voice{}", addr, query);
    let (mut ws, _) = connect_async(url).await.expect("connect");
    let started = next_frame(&mut ws).await.expect("session_started");
    match started {
        Frame::Json(v) => {
            assert_eq!(v["type"], "session_started");
            (ws, v)
        }
        Frame::Binary(_) => panic!("expected session_started"),
    }
}

async fn next_frame(ws: &mut Client) -> Option<Frame> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match msg.ok()? {
            Message::Text(text) => return Some(Frame::Json(serde_json::from_str(text.as_str()).unwrap())),
            Message::Binary(bytes) => return Some(Frame::Binary(bytes.to_vec())),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Collects frames up to and including the first one of type `until`.
async fn collect_until(ws: &mut Client, until: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(ws).await {
        let done = frame.kind() == Some(until);
        frames.push(frame);
        if done {
            return frames;
        }
    }
    panic!("connection closed before {}: {:?}", until, frames);
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn pcm(samples: impl Iterator<Item = i16>) -> Vec<u8> {
    samples.flat_map(|s| s.to_le_bytes()).collect()
}

fn tone(ms: usize) -> Vec<u8> {
    let n = ms * 16;
    pcm((0..n).map(|i| ((i as f32 * 2.0 * std::f32::consts::PI * 300.0 / 16_000.0).sin() * 9000.0) as i16))
}

fn silence(ms: usize) -> Vec<u8> {
    pcm(std::iter::repeat(0).take(ms * 16))
}

async fn send_audio(ws: &mut Client, audio: &[u8]) {
    for chunk in audio.chunks(640) {
        ws.send(Message::Binary(chunk.to_vec().into())).await.unwrap();
    }
}

async fn request_stats(ws: &mut Client) -> (Vec<Frame>, Value) {
    send_json(ws, json!({"type": "stats"})).await;
    let mut frames = collect_until(ws, "stats").await;
    let Some(Frame::Json(stats)) = frames.pop() else { unreachable!() };
    (frames, stats)
}

fn kinds(frames: &[Frame]) -> Vec<&str> {
    frames.iter().filter_map(Frame::kind).collect()
}

fn texts_of<'a>(frames: &'a [Frame], kind: &str) -> Vec<&'a str> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Json(v) if v["type"] == kind => v["text"].as_str(),
            _ => None,
        })
        .collect()
}

fn long_answer() -> Vec<&'static str> {
    vec!["One. "; 30]
}

#[tokio::test]
async fn test_text_turn_streams_text_and_audio() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["Hello there. ", "How are you?"]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, started) = connect(addr, "").await;
    assert_eq!(started["model"], "qwen3:4b");
    assert_eq!(started["tools"].as_array().unwrap().len(), 3);

    send_json(&mut ws, json!({"type": "text", "content": "Hi"})).await;
    let frames = collect_until(&mut ws, "stream_end").await;

    let text: String = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Json(v) if v["type"] == "text_chunk" => v["content"].as_str().map(String::from),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello there. How are you?");

    let mut spoken = Vec::new();
    for (i, frame) in frames.iter().enumerate() {
        if frame.kind() == Some("audio") {
            let Frame::Json(header) = frame else { unreachable!() };
            assert_eq!(header["sampleRate"], 22_050);
            assert_eq!(header["sequence"], spoken.len() as u64);
            match &frames[i + 1] {
                Frame::Binary(bytes) => assert_eq!(bytes.as_slice(), MOCK_PCM),
                other => panic!("expected audio payload, got {:?}", other),
            }
            spoken.push(header["text"].as_str().unwrap().to_string());
        }
    }
    assert_eq!(spoken, vec!["Hello there.", "How are you?"]);

    let Some(Frame::Json(end)) = frames.last() else { unreachable!() };
    assert_eq!(end["chunks"], 2);
}

#[tokio::test]
async fn test_spoken_turn_is_transcribed_and_answered() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["It is sunny."]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "?sample_rate=16000&channels=1").await;

    let mut audio = tone(500);
    audio.extend(silence(1000));
    for chunk in audio.chunks(640) {
        ws.send(Message::Binary(chunk.to_vec().into())).await.unwrap();
    }

    let frames = collect_until(&mut ws, "stream_end").await;
    let kinds: Vec<&str> = frames.iter().filter_map(Frame::kind).collect();

    let started = kinds.iter().position(|k| *k == "speech_started").unwrap();
    let transcribed = kinds.iter().position(|k| *k == "transcription").unwrap();
    assert!(started < transcribed);

    let transcription = frames
        .iter()
        .find_map(|f| match f {
            Frame::Json(v) if v["type"] == "transcription" => Some(v["text"].clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(transcription, MOCK_TRANSCRIPT);
    assert!(kinds.contains(&"audio"));

    send_json(&mut ws, json!({"type": "stats"})).await;
    let frames = collect_until(&mut ws, "stats").await;
    let Some(Frame::Json(stats)) = frames.last() else { unreachable!() };
    assert_eq!(stats["session"]["utterances"], 1);
    assert_eq!(stats["session"]["transcriptions"], 1);
    assert_eq!(stats["session"]["turns"], 1);
    assert_eq!(stats["session"]["audioBytesReceived"], audio.len() as u64);
}

#[tokio::test]
async fn test_exit_command_says_goodbye_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["unused"]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "text", "content": "Goodbye!"})).await;

    let goodbye = next_frame(&mut ws).await.unwrap();
    assert_eq!(goodbye.kind(), Some("goodbye"));
    assert!(next_frame(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_invalid_message_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["unused"]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    ws.send(Message::Text("not json".into())).await.unwrap();

    let Some(Frame::Json(error)) = next_frame(&mut ws).await else {
        panic!("expected an error frame");
    };
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().starts_with("Invalid message"));

    send_json(&mut ws, json!({"type": "text", "content": "   "})).await;
    let Some(Frame::Json(error)) = next_frame(&mut ws).await else {
        panic!("expected an error frame");
    };
    assert_eq!(error["message"], "Empty text message");
}

#[tokio::test]
async fn test_stats_frame_includes_agent_and_services() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["unused"]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, started) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "stats"})).await;

    let Some(Frame::Json(stats)) = next_frame(&mut ws).await else {
        panic!("expected a stats frame");
    };
    assert_eq!(stats["type"], "stats");
    assert_eq!(stats["session"]["sessionId"], started["sessionId"]);
    assert_eq!(stats["agent"]["toolsCount"], 3);
    assert_eq!(stats["agent"]["provider"], "ollama");
    assert_eq!(stats["stt"]["totalTranscriptions"], 0);
}

#[tokio::test]
async fn test_unknown_voice_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["unused"]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let err = connect_async(format!("ws://{}/voice?voice=nobody", addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_session_limit_returns_503() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["unused"]).await;
    let mut config = test_config(&dir, &llm);
    config.session.max_sessions = 1;
    let addr = spawn_server(config).await;

    let (_first, _) = connect(addr, "").await;

    let err = connect_async(format!("ws://{}/voice", addr))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_interrupt_stops_a_streaming_answer() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_slow_ollama(&long_answer(), Duration::from_millis(100)).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "text", "content": "Count"})).await;
    collect_until(&mut ws, "text_chunk").await;

    send_json(&mut ws, json!({"type": "interrupt"})).await;
    let frames = collect_until(&mut ws, "stop_playback").await;
    assert!(!kinds(&frames).contains(&"stream_end"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let (frames, stats) = request_stats(&mut ws).await;
    assert!(!kinds(&frames).contains(&"stream_end"));
    assert_eq!(stats["session"]["interruptions"], 1);
}

#[tokio::test]
async fn test_caller_speech_barges_in_on_answer() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_slow_ollama(&long_answer(), Duration::from_millis(100)).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "text", "content": "Count"})).await;
    collect_until(&mut ws, "text_chunk").await;

    send_audio(&mut ws, &tone(500)).await;
    let frames = collect_until(&mut ws, "speech_started").await;
    let kinds = kinds(&frames);
    assert!(kinds.contains(&"stop_playback"));
    assert!(!kinds.contains(&"stream_end"));

    let (_, stats) = request_stats(&mut ws).await;
    assert_eq!(stats["session"]["interruptions"], 1);
}

#[tokio::test]
async fn test_resumed_speech_drops_early_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["Sure."]).await;
    let mut config = test_config(&dir, &llm);
    slow_transcriber(&dir, &mut config, "0.3");
    let addr = spawn_server(config).await;

    let (mut ws, _) = connect(addr, "").await;
    // The pause is long enough to start transcribing but not to end the turn.
    let mut audio = tone(500);
    audio.extend(silence(300));
    audio.extend(tone(300));
    audio.extend(silence(1000));
    send_audio(&mut ws, &audio).await;

    let frames = collect_until(&mut ws, "stream_end").await;
    assert_eq!(texts_of(&frames, "transcription"), vec![MOCK_TRANSCRIPT]);
    assert_eq!(kinds(&frames).iter().filter(|k| **k == "speech_started").count(), 1);

    let (_, stats) = request_stats(&mut ws).await;
    assert_eq!(stats["session"]["utterances"], 2);
    assert_eq!(stats["session"]["transcriptions"], 1);
    assert_eq!(stats["session"]["turns"], 1);
}

#[tokio::test]
async fn test_long_turn_is_transcribed_whole() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["Sure."]).await;
    let mut config = test_config(&dir, &llm);
    config.vad.max_utterance_ms = 1000;
    config.vad.partial_interval_ms = 0;
    slow_transcriber(&dir, &mut config, "0.3");
    let addr = spawn_server(config).await;

    let (mut ws, _) = connect(addr, "").await;
    let mut audio = tone(1500);
    audio.extend(silence(1000));
    send_audio(&mut ws, &audio).await;

    let frames = collect_until(&mut ws, "stream_end").await;
    let kinds = kinds(&frames);
    assert_eq!(kinds.iter().filter(|k| **k == "speech_started").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "stop_playback").count(), 1);
    let whole = format!("{} {}", MOCK_TRANSCRIPT, MOCK_TRANSCRIPT);
    assert_eq!(texts_of(&frames, "transcription"), vec![whole.as_str()]);

    let (_, stats) = request_stats(&mut ws).await;
    assert_eq!(stats["session"]["utterances"], 2);
    assert_eq!(stats["session"]["transcriptions"], 1);
    assert_eq!(stats["session"]["turns"], 1);
}

#[tokio::test]
async fn test_interim_transcripts_while_talking() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["Sure."]).await;
    let mut config = test_config(&dir, &llm);
    config.vad.partial_interval_ms = 500;
    let addr = spawn_server(config).await;

    let (mut ws, _) = connect(addr, "").await;
    // Real-time pacing so the recognizer can answer mid-turn.
    for chunk in tone(1500).chunks(640) {
        ws.send(Message::Binary(chunk.to_vec().into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    send_audio(&mut ws, &silence(1000)).await;

    let frames = collect_until(&mut ws, "transcription").await;
    let partials = texts_of(&frames, "transcription_partial");
    assert!(!partials.is_empty());
    assert!(partials.iter().all(|t| *t == MOCK_TRANSCRIPT));

    let frames = collect_until(&mut ws, "stream_end").await;
    assert!(!kinds(&frames).contains(&"transcription_partial"));
}

#[tokio::test]
async fn test_clear_history_forgets_the_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["It is sunny."]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "text", "content": "Weather?"})).await;
    collect_until(&mut ws, "stream_end").await;

    let (_, stats) = request_stats(&mut ws).await;
    assert_eq!(stats["agent"]["historyLen"], 2);

    send_json(&mut ws, json!({"type": "clear_history"})).await;
    let (frames, stats) = request_stats(&mut ws).await;
    assert!(!kinds(&frames).contains(&"stop_playback"));
    assert_eq!(stats["agent"]["historyLen"], 0);
}

#[tokio::test]
async fn test_clear_history_stops_a_streaming_answer() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_slow_ollama(&long_answer(), Duration::from_millis(100)).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "text", "content": "Count"})).await;
    collect_until(&mut ws, "text_chunk").await;

    send_json(&mut ws, json!({"type": "clear_history"})).await;
    let frames = collect_until(&mut ws, "stop_playback").await;
    assert!(!kinds(&frames).contains(&"stream_end"));

    let (frames, stats) = request_stats(&mut ws).await;
    assert!(!kinds(&frames).contains(&"stream_end"));
    assert_eq!(stats["session"]["interruptions"], 1);
    assert_eq!(stats["agent"]["historyLen"], 0);
}

#[tokio::test]
async fn test_config_message_renegotiates_audio_format() {
    let dir = tempfile::tempdir().unwrap();
    let llm = spawn_mock_ollama(&["Sure."]).await;
    let addr = spawn_server(test_config(&dir, &llm)).await;

    let (mut ws, _) = connect(addr, "").await;
    send_json(&mut ws, json!({"type": "config", "sampleRate": 0})).await;
    let Some(Frame::Json(error)) = next_frame(&mut ws).await else {
        panic!("expected an error frame");
    };
    assert!(error["message"].as_str().unwrap().starts_with("Invalid audio format"));

    send_json(&mut ws, json!({"type": "config", "sampleRate": 48000, "channels": 2})).await;
    // 48 kHz stereo, both channels carrying the same tone.
    let stereo = |ms: usize, amplitude: f32| {
        pcm((0..ms * 48).flat_map(move |i| {
            let s = ((i as f32 * 2.0 * std::f32::consts::PI * 300.0 / 48_000.0).sin() * amplitude) as i16;
            [s, s]
        }))
    };
    let mut audio = stereo(600, 9000.0);
    audio.extend(stereo(1500, 0.0));
    for chunk in audio.chunks(3840) {
        ws.send(Message::Binary(chunk.to_vec().into())).await.unwrap();
    }

    let frames = collect_until(&mut ws, "stream_end").await;
    assert_eq!(texts_of(&frames, "transcription"), vec![MOCK_TRANSCRIPT]);
}
