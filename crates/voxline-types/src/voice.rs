//! Speech model identifiers and voice profile definitions.
//!
//! A `VoiceProfile` maps a logical ID to a specific TTS model and its
//! parameters. `SttModel` names the whisper checkpoints the transcriber can
//! load.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported TTS model architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceModel {
    /// Piper TTS (ONNX-based, fast, local).
    #[default]
    Piper,
    /// System TTS (`espeak-ng`).
    System,
}

fn default_speed() -> f32 {
    1.0
}

fn default_sample_rate() -> u32 {
    22_050
}

/// A voice profile configuration.
///
/// Defines how the agent's voice sounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Unique identifier for the voice profile.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The underlying TTS model architecture.
    #[serde(default)]
    pub model: VoiceModel,
    /// Path to the model file (relative to the voices directory or absolute).
    #[serde(default)]
    pub model_path: String,
    /// Path to the model configuration file (if applicable).
    #[serde(default)]
    pub config_path: Option<String>,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Speaker ID within a multi-speaker model (0-indexed).
    #[serde(default)]
    pub speaker_id: Option<u32>,
    /// Sample rate of the raw PCM the model produces.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            name: "Default Voice".to_string(),
            model: VoiceModel::Piper,
            model_path: "en_US-lessac-medium.onnx".to_string(),
            config_path: Some("en_US-lessac-medium.onnx.json".to_string()),
            speed: default_speed(),
            speaker_id: None,
            sample_rate: default_sample_rate(),
        }
    }
}

/// Whisper checkpoints, from fastest to most accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SttModel {
    #[default]
    #[serde(rename = "tiny.en")]
    TinyEn,
    #[serde(rename = "tiny")]
    Tiny,
    #[serde(rename = "base.en")]
    BaseEn,
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "small.en")]
    SmallEn,
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "medium.en")]
    MediumEn,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "large-v1")]
    LargeV1,
    #[serde(rename = "large-v2")]
    LargeV2,
    #[serde(rename = "large-v3")]
    LargeV3,
}

impl SttModel {
    pub const ALL: [SttModel; 11] = [
        Self::TinyEn,
        Self::Tiny,
        Self::BaseEn,
        Self::Base,
        Self::SmallEn,
        Self::Small,
        Self::MediumEn,
        Self::Medium,
        Self::LargeV1,
        Self::LargeV2,
        Self::LargeV3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TinyEn => "tiny.en",
            Self::Tiny => "tiny",
            Self::BaseEn => "base.en",
            Self::Base => "base",
            Self::SmallEn => "small.en",
            Self::Small => "small",
            Self::MediumEn => "medium.en",
            Self::Medium => "medium",
            Self::LargeV1 => "large-v1",
            Self::LargeV2 => "large-v2",
            Self::LargeV3 => "large-v3",
        }
    }

    /// File name of the GGML checkpoint as distributed for whisper.cpp.
    pub fn ggml_file_name(self) -> String {
        format!("ggml-{}.bin", self.as_str())
    }

    /// Whether the checkpoint only understands English.
    pub fn is_english_only(self) -> bool {
        self.as_str().ends_with(".en")
    }
}

impl fmt::Display for SttModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SttModel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| ParseError {
                kind: "STT model",
                value: s.to_string(),
            })
    }
}
