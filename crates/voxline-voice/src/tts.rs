use crate::error::VoiceError;
use crate::pcm::strip_wav_header;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use voxline_types::{VoiceModel, VoiceProfile};

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Sample rate of `espeak-ng --stdout`.
const ESPEAK_SAMPLE_RATE: u32 = 22_050;

/// Raw audio produced by a synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Mono s16le PCM.
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    /// Playback length of the audio.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let samples = self.pcm.len() as f64 / 2.0;
        Duration::from_secs_f64(samples / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsStats {
    pub total_syntheses: u64,
    pub total_characters_processed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    syntheses: AtomicU64,
    characters: AtomicU64,
}

/// Service for generating speech from text.
#[derive(Debug, Clone)]
pub struct TtsService {
    profiles: Arc<RwLock<HashMap<String, VoiceProfile>>>,
    voices_dir: PathBuf,
    piper_binary: PathBuf,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl TtsService {
    /// Creates a new `TtsService` with the given voices directory and piper
    /// binary path.
    pub fn new(voices_dir: impl AsRef<Path>, piper_binary: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            profiles: Arc::new(RwLock::new(HashMap::new())),
            voices_dir: voices_dir.as_ref().to_path_buf(),
            piper_binary: piper_binary.as_ref().to_path_buf(),
            timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Adds a voice profile to the service, replacing one with the same ID.
    pub async fn add_profile(&self, profile: VoiceProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile);
    }

    /// Retrieves a voice profile by ID.
    pub async fn get_profile(&self, id: &str) -> Option<VoiceProfile> {
        self.profiles.read().await.get(id).cloned()
    }

    /// IDs of all registered profiles, sorted.
    pub async fn profile_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> TtsStats {
        TtsStats {
            total_syntheses: self.counters.syntheses.load(Ordering::Relaxed),
            total_characters_processed: self.counters.characters.load(Ordering::Relaxed),
        }
    }

    /// Synthesizes speech from the given text using the specified profile.
    pub async fn synthesize(
        &self,
        text: &str,
        profile_id: &str,
    ) -> Result<SynthesizedAudio, VoiceError> {
        if text.trim().is_empty() {
            return Err(VoiceError::Tts("empty text".to_string()));
        }
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let profile = self
            .get_profile(profile_id)
            .await
            .ok_or_else(|| VoiceError::ProfileNotFound(profile_id.to_string()))?;

        let audio = match profile.model {
            VoiceModel::Piper => self.synthesize_piper(text, &profile).await?,
            VoiceModel::System => self.synthesize_system(text).await?,
        };

        self.counters.syntheses.fetch_add(1, Ordering::Relaxed);
        self.counters
            .characters
            .fetch_add(text.chars().count() as u64, Ordering::Relaxed);
        Ok(audio)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.voices_dir.join(path)
        }
    }

    async fn synthesize_piper(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<SynthesizedAudio, VoiceError> {
        let model_path = self.resolve(&profile.model_path);

        if !model_path.exists() {
            return Err(VoiceError::Tts(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        if profile.speed < 0.1 || profile.speed > 10.0 {
            return Err(VoiceError::Config(
                "Speed must be between 0.1 and 10.0".to_string(),
            ));
        }

        let mut command = Command::new(&self.piper_binary);
        command
            .arg("--model")
            .arg(model_path)
            .arg("--output_raw")
            // Length scale is inverse of speed: speed 2.0 gives 0.5.
            .arg("--length_scale")
            .arg((1.0 / profile.speed).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(config) = &profile.config_path {
            command.arg("--config").arg(self.resolve(config));
        }

        if let Some(speaker) = profile.speaker_id {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let text_owned = format!("{}\n", text);

        // Spawn a task to write to stdin to avoid deadlock if output buffer fills up
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "TTS process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;

        match write_task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr.trim())));
        }

        Ok(SynthesizedAudio {
            pcm: output.stdout,
            sample_rate: profile.sample_rate,
        })
    }

    /// Synthesizes speech using `espeak-ng`, stripping the WAV header it
    /// writes to stdout.
    async fn synthesize_system(&self, text: &str) -> Result<SynthesizedAudio, VoiceError> {
        let mut command = Command::new("espeak-ng");
        command
            .arg("--stdout")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn espeak-ng: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                VoiceError::Tts(format!(
                    "System TTS process timed out after {} seconds",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for espeak-ng: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("espeak-ng failed: {}", stderr.trim())));
        }

        Ok(SynthesizedAudio {
            pcm: strip_wav_header(&output.stdout).to_vec(),
            sample_rate: ESPEAK_SAMPLE_RATE,
        })
    }
}
