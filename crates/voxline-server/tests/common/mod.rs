#![allow(dead_code)]

use axum::body::Body;
use axum::routing::post;
use axum::Router;
use futures_util::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use voxline_server::config::Config;
use voxline_server::{app, AppState};
use voxline_types::{VoiceModel, VoiceProfile};

/// Raw PCM the mock synthesizer prints for every sentence.
pub const MOCK_PCM: &[u8] = b"abcd";

/// Transcript the mock recognizer prints.
pub const MOCK_TRANSCRIPT: &str = "What is the weather";

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn ndjson_lines(parts: &[&str]) -> Vec<String> {
    let mut lines: Vec<String> = parts
        .iter()
        .map(|p| {
            format!(
                "{}\n",
                json!({"message": {"role": "assistant", "content": p}, "done": false})
            )
        })
        .collect();
    lines.push(format!(
        "{}\n",
        json!({"message": {"role": "assistant", "content": ""}, "done": true})
    ));
    lines
}

/// Streams `parts` as an Ollama NDJSON chat response for every request.
pub async fn spawn_mock_ollama(parts: &[&str]) -> String {
    let body: String = ndjson_lines(parts).concat();
    let app = Router::new().route(
        "/api/chat",
        post(move || {
            let body = body.clone();
            async move { body }
        }),
    );
    serve_mock(app).await
}

/// Like [`spawn_mock_ollama`] but waits `delay` before every line, so an
/// answer is still streaming when the test acts on it.
pub async fn spawn_slow_ollama(parts: &[&str], delay: Duration) -> String {
    let lines = ndjson_lines(parts);
    let app = Router::new().route(
        "/api/chat",
        post(move || {
            let lines = lines.clone();
            async move {
                Body::from_stream(futures_util::stream::iter(lines).then(move |line| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(line)
                }))
            }
        }),
    );
    serve_mock(app).await
}

async fn serve_mock(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Config wired to mock whisper and piper scripts inside `dir`.
pub fn test_config(dir: &TempDir, llm_base_url: &str) -> Config {
    let stt = write_script(
        dir.path(),
        "mock_whisper.sh",
        &format!("#!/bin/sh\ncat > /dev/null\necho '{}'\n", MOCK_TRANSCRIPT),
    );
    let piper = write_script(
        dir.path(),
        "mock_piper.sh",
        "#!/bin/sh\ncat > /dev/null\nprintf 'abcd'\n",
    );
    std::fs::File::create(dir.path().join("test.onnx")).unwrap();

    let mut config = Config::default();
    config.llm.model = "qwen3:4b".to_string();
    config.llm.ollama_base_url = llm_base_url.to_string();
    config.stt.binary_path = stt.to_string_lossy().into_owned();
    config.stt.model_path = Some(dir.path().join("ggml-test.bin").to_string_lossy().into_owned());
    config.tts.piper_binary = piper.to_string_lossy().into_owned();
    config.tts.voices_dir = dir.path().to_string_lossy().into_owned();
    config.tts.profiles = vec![VoiceProfile {
        id: "default".to_string(),
        name: "Test".to_string(),
        model: VoiceModel::Piper,
        model_path: "test.onnx".to_string(),
        config_path: None,
        speed: 1.0,
        speaker_id: None,
        sample_rate: 22_050,
    }];
    config
}

/// Swaps in a recognizer that takes `seconds` before answering.
pub fn slow_transcriber(dir: &TempDir, config: &mut Config, seconds: &str) {
    let stt = write_script(
        dir.path(),
        "slow_whisper.sh",
        &format!(
            "#!/bin/sh\ncat > /dev/null\nsleep {}\necho '{}'\n",
            seconds, MOCK_TRANSCRIPT
        ),
    );
    config.stt.binary_path = stt.to_string_lossy().into_owned();
}

/// Serves the app on an ephemeral port and returns its address.
pub async fn spawn_server(config: Config) -> SocketAddr {
    let state = AppState::from_config(config).await;
    let router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}
