use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Missing API key for {0}")]
    MissingApiKey(&'static str),

    #[error("Malformed response stream: {0}")]
    Stream(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
