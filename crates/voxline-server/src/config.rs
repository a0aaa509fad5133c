//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use voxline_agent::LlmSettings;
use voxline_types::{LlmProvider, SttModel, VoiceProfile};
use voxline_voice::VadConfig;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Language model provider and agent behavior.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Speech recognition.
    #[serde(default)]
    pub stt: SttConfig,

    /// Speech synthesis and voice profiles.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Turn detection tuning.
    #[serde(default)]
    pub vad: VadConfig,

    /// Per-connection limits and default audio format.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxline_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,

    /// Empty selects the provider default.
    #[serde(default)]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,

    #[serde(default = "default_groq_base_url")]
    pub groq_base_url: String,

    /// Usually supplied through `GROQ_API_KEY` instead.
    #[serde(default)]
    pub groq_api_key: Option<String>,

    /// Remembered user/assistant exchanges.
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,

    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Replaces the built-in voice companion prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SttConfig {
    /// whisper.cpp command line binary.
    #[serde(default = "default_stt_binary")]
    pub binary_path: String,

    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    #[serde(default)]
    pub model: SttModel,

    /// Explicit model file; overrides `models_dir` + `model`.
    #[serde(default)]
    pub model_path: Option<String>,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_process_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_piper_binary")]
    pub piper_binary: String,

    #[serde(default = "default_voices_dir")]
    pub voices_dir: String,

    /// Profile used when a caller does not pick one.
    #[serde(default = "default_profile_id")]
    pub default_profile: String,

    #[serde(default = "default_process_timeout_secs")]
    pub timeout_secs: u64,

    /// Voice profiles. When empty the stock piper voice is registered.
    #[serde(default)]
    pub profiles: Vec<VoiceProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Concurrent voice sessions; further connections get 503.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Frames queued per connection before senders wait.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Caller audio format assumed until the client says otherwise.
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,

    #[serde(default = "default_input_channels")]
    pub input_channels: u16,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_groq_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_max_history_turns() -> usize {
    3
}

fn default_max_tool_rounds() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_stt_binary() -> String {
    "whisper-cli".to_string()
}

fn default_models_dir() -> String {
    "models".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_process_timeout_secs() -> u64 {
    30
}

fn default_piper_binary() -> String {
    "piper".to_string()
}

fn default_voices_dir() -> String {
    "assets/voices".to_string()
}

fn default_profile_id() -> String {
    "default".to_string()
}

fn default_max_sessions() -> usize {
    32
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_input_sample_rate() -> u32 {
    16_000
}

fn default_input_channels() -> u16 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: String::new(),
            temperature: default_temperature(),
            ollama_base_url: default_ollama_base_url(),
            groq_base_url: default_groq_base_url(),
            groq_api_key: None,
            max_history_turns: default_max_history_turns(),
            max_tool_rounds: default_max_tool_rounds(),
            request_timeout_secs: default_request_timeout_secs(),
            system_prompt: None,
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            binary_path: default_stt_binary(),
            models_dir: default_models_dir(),
            model: SttModel::default(),
            model_path: None,
            language: default_language(),
            timeout_secs: default_process_timeout_secs(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            piper_binary: default_piper_binary(),
            voices_dir: default_voices_dir(),
            default_profile: default_profile_id(),
            timeout_secs: default_process_timeout_secs(),
            profiles: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            outbound_buffer: default_outbound_buffer(),
            input_sample_rate: default_input_sample_rate(),
            input_channels: default_input_channels(),
        }
    }
}

impl LlmConfig {
    pub fn to_settings(&self) -> LlmSettings {
        LlmSettings {
            provider: self.provider,
            model: self.model.clone(),
            temperature: self.temperature,
            ollama_base_url: self.ollama_base_url.clone(),
            groq_base_url: self.groq_base_url.clone(),
            groq_api_key: self.groq_api_key.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

impl SttConfig {
    /// The whisper model file to load.
    pub fn resolved_model_path(&self) -> PathBuf {
        match &self.model_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.models_dir).join(self.model.ggml_file_name()),
        }
    }
}

impl TtsConfig {
    /// Configured profiles, or the stock voice when none are configured.
    pub fn effective_profiles(&self) -> Vec<VoiceProfile> {
        if self.profiles.is_empty() {
            vec![VoiceProfile::default()]
        } else {
            self.profiles.clone()
        }
    }
}

impl Config {
    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".into()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.llm.max_history_turns == 0 {
            return Err(ConfigError::Invalid(
                "llm.max_history_turns must be at least 1".into(),
            ));
        }
        if !(self.vad.early_trigger_ratio > 0.0 && self.vad.early_trigger_ratio <= 1.0) {
            return Err(ConfigError::Invalid(
                "vad.early_trigger_ratio must be in (0, 1]".into(),
            ));
        }
        if self.vad.frame_ms == 0 {
            return Err(ConfigError::Invalid("vad.frame_ms must not be 0".into()));
        }
        if self.session.input_sample_rate == 0 || self.session.input_channels == 0 {
            return Err(ConfigError::Invalid(
                "session.input_sample_rate and session.input_channels must not be 0".into(),
            ));
        }
        if self.session.max_sessions == 0 || self.session.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "session.max_sessions and session.outbound_buffer must not be 0".into(),
            ));
        }
        let profiles = self.tts.effective_profiles();
        if !profiles.iter().any(|p| p.id == self.tts.default_profile) {
            return Err(ConfigError::Invalid(format!(
                "tts.default_profile '{}' does not match any profile",
                self.tts.default_profile
            )));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXLINE_HOST`, `VOXLINE_PORT` override `server.host` / `server.port`
/// - `VOXLINE_LOG_LEVEL`, `VOXLINE_LOG_JSON` override `logging.*`
/// - `VOXLINE_LLM_PROVIDER`, `VOXLINE_LLM_MODEL`, `VOXLINE_LLM_TEMPERATURE`
///   override `llm.provider` / `llm.model` / `llm.temperature`
/// - `OLLAMA_BASE_URL` overrides `llm.ollama_base_url`
/// - `GROQ_API_KEY` overrides `llm.groq_api_key`
/// - `VOXLINE_STT_BINARY`, `VOXLINE_STT_MODEL_PATH` override `stt.binary_path` / `stt.model_path`
/// - `VOXLINE_PIPER_BINARY`, `VOXLINE_VOICES_DIR` override `tts.piper_binary` / `tts.voices_dir`
///
/// The result is validated before it is returned.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, an
/// override is malformed, or the final configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = var("VOXLINE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("VOXLINE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("VOXLINE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("VOXLINE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(provider) = var("VOXLINE_LLM_PROVIDER") {
        config.llm.provider = provider
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("VOXLINE_LLM_PROVIDER: {}", e)))?;
    }
    if let Some(model) = var("VOXLINE_LLM_MODEL") {
        config.llm.model = model;
    }
    if let Some(temperature) = var("VOXLINE_LLM_TEMPERATURE") {
        config.llm.temperature = temperature.parse().map_err(|_| {
            ConfigError::Invalid(format!("VOXLINE_LLM_TEMPERATURE: not a number: {}", temperature))
        })?;
    }
    if let Some(url) = var("OLLAMA_BASE_URL") {
        config.llm.ollama_base_url = url;
    }
    if let Some(key) = var("GROQ_API_KEY").filter(|k| !k.trim().is_empty()) {
        config.llm.groq_api_key = Some(key);
    }
    if let Some(binary) = var("VOXLINE_STT_BINARY") {
        config.stt.binary_path = binary;
    }
    if let Some(path) = var("VOXLINE_STT_MODEL_PATH") {
        config.stt.model_path = Some(path);
    }
    if let Some(binary) = var("VOXLINE_PIPER_BINARY") {
        config.tts.piper_binary = binary;
    }
    if let Some(dir) = var("VOXLINE_VOICES_DIR") {
        config.tts.voices_dir = dir;
    }
    Ok(())
}
