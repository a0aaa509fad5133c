//! Groq client over the OpenAI-compatible chat completions API, streamed as
//! server-sent events.

use crate::client::{ensure_success, tool_declaration, Completion, Flow, LineBuffer};
use crate::error::AgentError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::debug;
use voxline_types::{ChatMessage, Role, ToolCall, ToolSpec};

#[derive(Clone)]
pub struct GroqClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl std::fmt::Debug for GroqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroqClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// A tool call assembled from indexed fragments.
#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl GroqClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        model: String,
        temperature: f32,
    ) -> Self {
        Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
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
            "temperature": self.temperature,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(tool_declaration).collect();
            body["tool_choice"] = json!("auto");
        }

        debug!(model = %self.model, messages = messages.len(), "sending groq chat request");
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let mut response = ensure_success(response).await?;

        let mut content = String::new();
        let mut calls = BTreeMap::new();
        let mut lines = LineBuffer::default();
        let mut flow = Flow::Continue;
        'stream: while let Some(chunk) = response.chunk().await? {
            for line in lines.push(&chunk) {
                flow = handle_line(&line, &mut content, &mut calls, tokens).await?;
                if flow == Flow::Stop {
                    break 'stream;
                }
            }
        }
        if flow == Flow::Continue {
            if let Some(line) = lines.finish() {
                handle_line(&line, &mut content, &mut calls, tokens).await?;
            }
        }

        let tool_calls = calls
            .into_values()
            .enumerate()
            .map(|(i, call)| finish_call(i, call))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Completion {
            content,
            tool_calls,
        })
    }
}

async fn handle_line(
    line: &str,
    content: &mut String,
    calls: &mut BTreeMap<usize, PartialCall>,
    tokens: &mpsc::Sender<String>,
) -> Result<Flow, AgentError> {
    // Comments and event names carry nothing we use.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Flow::Continue);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Flow::Stop);
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AgentError::Stream(format!("invalid groq event: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(AgentError::Stream(error.to_string()));
    }

    for choice in chunk.choices {
        for fragment in choice.delta.tool_calls {
            let call = calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                call.id = id;
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }
        }
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            content.push_str(&text);
            if tokens.send(text).await.is_err() {
                return Ok(Flow::Stop);
            }
        }
    }
    Ok(Flow::Continue)
}

fn finish_call(position: usize, call: PartialCall) -> Result<ToolCall, AgentError> {
    let arguments = if call.arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&call.arguments)?
    };
    let id = if call.id.is_empty() {
        format!("call_{}", position)
    } else {
        call.id
    };
    Ok(ToolCall {
        id,
        name: call.name,
        arguments,
    })
}

fn wire_message(message: &ChatMessage) -> Value {
    match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments.to_string() },
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                json!(message.content)
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        role => json!({ "role": role, "content": message.content }),
    }
}
