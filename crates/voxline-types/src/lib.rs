//! Shared types for the Voxline voice agent.
//!
//! This crate provides the serializable types passed between the voice,
//! agent and server crates: chat messages and tool calls exchanged with
//! language models, speech model identifiers, voice profiles, and the
//! per-session statistics reported over the API.
//!
//! No crate in the workspace depends on anything *except* `voxline-types`
//! for cross-cutting type definitions.

pub mod chat;
pub mod session;
pub mod voice;

pub use chat::{ChatMessage, Role, ToolCall, ToolSpec};
pub use session::{SessionStats, SessionTimings};
pub use voice::{SttModel, VoiceModel, VoiceProfile};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing an identifier string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    /// What was being parsed (e.g. "LLM provider").
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Language model backends the agent can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Groq cloud inference (OpenAI-compatible API).
    Groq,
    /// A local Ollama server.
    #[default]
    Ollama,
}

impl LlmProvider {
    /// All providers, in the order they are advertised.
    pub const ALL: [LlmProvider; 2] = [LlmProvider::Groq, LlmProvider::Ollama];

    /// Returns the wire name of the provider.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProvider {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(Self::Groq),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ParseError {
                kind: "LLM provider",
                value: s.to_string(),
            }),
        }
    }
}
