//! Conversational agent: streaming LLM clients for Ollama and Groq, a tool
//! registry, and a history-keeping agent that drives them.

pub mod agent;
pub mod client;
pub mod error;
pub mod groq;
pub mod ollama;
pub mod provider;
pub mod tools;

pub use agent::{is_exit_command, AgentEvent, AgentStats, VoiceAgent, DEFAULT_SYSTEM_PROMPT};
pub use client::{Completion, LlmClient, LlmSettings};
pub use error::AgentError;
pub use provider::{available_providers, common_models, default_model, supports_tools};
pub use tools::{mock_tools, Tool, ToolRegistry};
