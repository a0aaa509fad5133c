//! Model catalog for the supported providers.

use voxline_types::LlmProvider;

/// Ollama model families known to handle tool calls.
const TOOL_CAPABLE_FAMILIES: [&str; 5] = [
    "gemma3-tools",
    "PetrosStav/gemma3-tools",
    "mistral",
    "llama3.2",
    "qwen3",
];

/// Model used when none is configured.
pub fn default_model(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::Groq => "meta-llama/llama-4-scout-17b-16e-instruct",
        LlmProvider::Ollama => "qwen3:4b-instruct-2507-q4_K_M",
    }
}

/// Models worth offering in a picker.
pub fn common_models(provider: LlmProvider) -> &'static [&'static str] {
    match provider {
        LlmProvider::Groq => &[
            "llama-3.3-70b-versatile",
            "meta-llama/llama-4-scout-17b-16e-instruct",
            "meta-llama/llama-4-maverick-17b-128e-instruct",
            "moonshotai/kimi-k2-instruct-0905",
        ],
        LlmProvider::Ollama => &["qwen3:4b-instruct-2507-q4_K_M", "mistral:7b"],
    }
}

pub fn available_providers() -> Vec<&'static str> {
    LlmProvider::ALL.iter().map(|p| p.as_str()).collect()
}

/// Whether an Ollama model is likely to support tool calls. The family is the
/// part of the tag before the first `:`.
pub fn supports_tools(model: &str) -> bool {
    let family = model.split(':').next().unwrap_or(model);
    TOOL_CAPABLE_FAMILIES.contains(&family)
}
