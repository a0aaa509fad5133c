use crate::error::AgentError;
use crate::groq::GroqClient;
use crate::ollama::OllamaClient;
use crate::provider::default_model;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use voxline_types::{ChatMessage, LlmProvider, ToolCall, ToolSpec};

const USER_AGENT: &str = concat!("voxline/", env!("CARGO_PKG_VERSION"));

/// Everything needed to build an [`LlmClient`].
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    /// Empty selects the provider default.
    pub model: String,
    pub temperature: f32,
    pub ollama_base_url: String,
    pub groq_base_url: String,
    pub groq_api_key: Option<String>,
    pub request_timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            model: String::new(),
            temperature: 0.7,
            ollama_base_url: "http://localhost:11434".to_string(),
            groq_base_url: "https://api.groq.com/openai/v1".to_string(),
            groq_api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl LlmSettings {
    /// The configured model, or the provider default.
    pub fn resolved_model(&self) -> String {
        if self.model.trim().is_empty() {
            default_model(self.provider).to_string()
        } else {
            self.model.clone()
        }
    }
}

/// The result of one streamed completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// A streaming chat client for one of the supported providers.
#[derive(Debug, Clone)]
pub enum LlmClient {
    Ollama(OllamaClient),
    Groq(GroqClient),
}

impl LlmClient {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let model = settings.resolved_model();

        match settings.provider {
            LlmProvider::Ollama => Ok(Self::Ollama(OllamaClient::new(
                http,
                &settings.ollama_base_url,
                model,
                settings.temperature,
            ))),
            LlmProvider::Groq => {
                let api_key = settings
                    .groq_api_key
                    .as_deref()
                    .filter(|k| !k.trim().is_empty())
                    .ok_or(AgentError::MissingApiKey("groq"))?;
                Ok(Self::Groq(GroqClient::new(
                    http,
                    &settings.groq_base_url,
                    api_key,
                    model,
                    settings.temperature,
                )))
            }
        }
    }

    pub fn provider(&self) -> LlmProvider {
        match self {
            Self::Ollama(_) => LlmProvider::Ollama,
            Self::Groq(_) => LlmProvider::Groq,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Self::Ollama(c) => c.model(),
            Self::Groq(c) => c.model(),
        }
    }

    /// Streams a completion, sending each text delta through `tokens`.
    ///
    /// Stops early, without error, once the receiver is gone.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tokens: &mpsc::Sender<String>,
    ) -> Result<Completion, AgentError> {
        match self {
            Self::Ollama(c) => c.stream_chat(messages, tools, tokens).await,
            Self::Groq(c) => c.stream_chat(messages, tools, tokens).await,
        }
    }
}

/// Whether the stream should keep going after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// OpenAI-style function declaration, understood by both providers.
pub(crate) fn tool_declaration(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

/// Turns a non-2xx response into [`AgentError::Provider`].
pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::Provider {
        status: status.as_u16(),
        body,
    })
}

/// Splits a byte stream into lines. Bytes are kept until a newline arrives
/// so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}
