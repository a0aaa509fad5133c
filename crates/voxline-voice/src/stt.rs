use crate::error::VoiceError;
use crate::pcm::wrap_wav;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Maximum audio input size for STT (10 MiB). Prevents OOM from oversized payloads.
const MAX_STT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Counters exposed through the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SttStats {
    pub total_transcriptions: u64,
    pub failed_transcriptions: u64,
    pub last_duration_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    failed: AtomicU64,
    last_duration_ms: AtomicU64,
}

/// Speech-to-text through the whisper.cpp command line tool.
///
/// Each call spawns the binary, streams a WAV file to its stdin and reads
/// the transcript from stdout.
#[derive(Debug, Clone)]
pub struct SttService {
    binary_path: PathBuf,
    model_path: PathBuf,
    language: String,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl SttService {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        model_path: impl Into<PathBuf>,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: model_path.into(),
            language: language.into(),
            timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn stats(&self) -> SttStats {
        SttStats {
            total_transcriptions: self.counters.total.load(Ordering::Relaxed),
            failed_transcriptions: self.counters.failed.load(Ordering::Relaxed),
            last_duration_ms: self.counters.last_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// Transcribes mono samples recorded at `sample_rate`.
    ///
    /// Returns an empty string when the recognizer heard nothing.
    pub async fn transcribe(&self, samples: &[i16], sample_rate: u32) -> Result<String, VoiceError> {
        let started = Instant::now();
        let result = self.run(samples, sample_rate).await;
        let elapsed = started.elapsed().as_millis() as u64;
        self.counters.last_duration_ms.store(elapsed, Ordering::Relaxed);
        match &result {
            Ok(text) => {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
                debug!(elapsed_ms = elapsed, chars = text.len(), "transcription finished");
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn run(&self, samples: &[i16], sample_rate: u32) -> Result<String, VoiceError> {
        let audio_data = wrap_wav(samples, sample_rate);
        if audio_data.len() > MAX_STT_INPUT_BYTES {
            return Err(VoiceError::Stt(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio_data.len(),
                MAX_STT_INPUT_BYTES
            )));
        }

        let mut command = Command::new(&self.binary_path);

        // whisper.cpp: -m model, -l language, -nt no timestamps,
        // -np no progress/system prints, -f - read the WAV from stdin.
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-l")
            .arg(&self.language)
            .arg("-nt")
            .arg("-np")
            .arg("-f")
            .arg("-")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Stt(format!("Failed to spawn STT binary: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Stt("Failed to open stdin".to_string()))?;

        // Spawn a task to write to stdin to avoid deadlock if output buffer fills up
        let write_task = tokio::spawn(async move {
            let result = stdin.write_all(&audio_data).await;
            drop(stdin); // Close stdin to signal EOF
            result
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Stt(format!(
                    "STT process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Stt(format!("Failed to read stdout: {}", e)))?;

        // A recognizer that exits without draining stdin is not an error as
        // long as it produced a transcript.
        if let Ok(Err(e)) = write_task.await {
            debug!("STT stdin closed early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Stt(format!("STT binary failed: {}", stderr.trim())));
        }

        Ok(clean_transcript(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Joins whisper's output lines and drops non-speech annotations such as
/// `[BLANK_AUDIO]` or `(music)`.
fn clean_transcript(raw: &str) -> String {
    let mut words = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let is_annotation = (line.starts_with('[') && line.ends_with(']'))
            || (line.starts_with('(') && line.ends_with(')'));
        if !is_annotation {
            words.push(line);
        }
    }
    words.join(" ")
}
