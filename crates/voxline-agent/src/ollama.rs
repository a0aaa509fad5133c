//! Ollama `/api/chat` client. The response is newline-delimited JSON.

use crate::client::{ensure_success, tool_declaration, Completion, Flow, LineBuffer};
use crate::error::AgentError;
use crate::provider::supports_tools;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use voxline_types::{ChatMessage, Role, ToolCall, ToolSpec};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    function: ChunkFunction,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: String, temperature: f32) -> Self {
        if !supports_tools(&model) {
            warn!(
                model = %model,
                "model may not support tool calls; tool requests could be ignored"
            );
        }
        Self {
            http,
            endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
            model,
            temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        tokens: &mpsc::Sender<String>,
    ) -> Result<Completion, AgentError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
            "think": false,
            "options": { "temperature": self.temperature },
        });
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(tool_declaration).collect();
        }

        debug!(model = %self.model, messages = messages.len(), "sending ollama chat request");
        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let mut response = ensure_success(response).await?;

        let mut completion = Completion::default();
        let mut lines = LineBuffer::default();
        while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk) {
                if self.handle_line(&line, &mut completion, tokens).await? == Flow::Stop {
                    return Ok(completion);
                }
            }
        }
        if let Some(line) = lines.finish() {
            self.handle_line(&line, &mut completion, tokens).await?;
        }
        Ok(completion)
    }

    async fn handle_line(
        &self,
        line: &str,
        completion: &mut Completion,
        tokens: &mpsc::Sender<String>,
    ) -> Result<Flow, AgentError> {
        let chunk: StreamChunk = serde_json::from_str(line)
            .map_err(|e| AgentError::Stream(format!("invalid ollama chunk: {}", e)))?;
        if let Some(error) = chunk.error {
            return Err(AgentError::Stream(error));
        }

        if let Some(message) = chunk.message {
            for call in message.tool_calls {
                let arguments = match call.function.arguments {
                    Value::Null => json!({}),
                    // Some models emit arguments as an encoded string.
                    Value::String(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
                    other => other,
                };
                completion.tool_calls.push(ToolCall {
                    id: format!("call_{}", completion.tool_calls.len()),
                    name: call.function.name,
                    arguments,
                });
            }
            if !message.content.is_empty() {
                completion.content.push_str(&message.content);
                if tokens.send(message.content).await.is_err() {
                    return Ok(Flow::Stop);
                }
            }
        }

        Ok(if chunk.done { Flow::Stop } else { Flow::Continue })
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut value = json!({
        "role": message.role,
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|c| json!({ "function": { "name": c.name, "arguments": c.arguments } }))
            .collect();
    }
    if message.role == Role::Tool {
        if let Some(name) = &message.name {
            value["tool_name"] = json!(name);
        }
    }
    value
}
