use crate::client::{Completion, LlmClient};
use crate::error::AgentError;
use crate::tools::{Tool, ToolRegistry};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use voxline_types::{ChatMessage, LlmProvider, ToolSpec};

/// Prompt tuned for answers that are spoken, not read.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a warm and helpful AI companion in a voice conversation.

Everything you write is read aloud. Never use emojis, markdown, asterisks, \
lists or any other visual symbols. Keep answers short and conversational, \
the way you would talk to a friend. Give direct answers and let the user ask \
if they want more detail.";

const DEFAULT_MAX_HISTORY_TURNS: usize = 3;
const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;
const TOKEN_BUFFER: usize = 64;

/// Words that end a conversation.
const EXIT_COMMANDS: [&str; 4] = ["exit", "quit", "goodbye", "stop"];

/// Progress of a response, streamed while it is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Token(String),
    ToolStarted { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub model: String,
    pub provider: LlmProvider,
    pub tools_count: usize,
    pub tool_names: Vec<String>,
    pub max_history_turns: usize,
    pub history_len: usize,
}

/// A conversational agent with short-term memory and tools.
#[derive(Debug)]
pub struct VoiceAgent {
    client: LlmClient,
    tools: ToolRegistry,
    system_prompt: String,
    history: Vec<ChatMessage>,
    max_history_turns: usize,
    max_tool_rounds: usize,
}

impl VoiceAgent {
    pub fn new(client: LlmClient, tools: ToolRegistry) -> Self {
        Self {
            client,
            tools,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history: Vec::new(),
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_history_turns(mut self, turns: usize) -> Self {
        self.max_history_turns = turns.max(1);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Adds a tool. Returns `false` if the name is taken.
    pub fn add_tool(&mut self, tool: Tool) -> bool {
        self.tools.add(tool)
    }

    pub fn remove_tool(&mut self, name: &str) -> bool {
        self.tools.remove(name)
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.specs()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            model: self.client.model().to_string(),
            provider: self.client.provider(),
            tools_count: self.tools.len(),
            tool_names: self.tools.names(),
            max_history_turns: self.max_history_turns,
            history_len: self.history.len(),
        }
    }

    /// Answers one user turn, streaming tokens and tool activity to `events`.
    ///
    /// Returns the final answer. Failures are turned into an `Error: ...`
    /// answer so the caller always has something to say.
    pub async fn respond(&mut self, user_message: &str, events: &mpsc::Sender<AgentEvent>) -> String {
        match self.run(user_message, events).await {
            Ok(answer) => {
                let answer = answer.trim().to_string();
                if !answer.is_empty() {
                    self.record(user_message, &answer);
                }
                answer
            }
            Err(e) => {
                warn!(error = %e, model = %self.client.model(), "agent turn failed");
                let message = format!("Error: {}", e);
                self.record(user_message, &message);
                let _ = events.send(AgentEvent::Token(message.clone())).await;
                message
            }
        }
    }

    async fn run(
        &self,
        user_message: &str,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<String, AgentError> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend(self.recent_history().iter().cloned());
        messages.push(ChatMessage::user(user_message));

        let specs = self.tools.specs();
        let mut answer = String::new();
        for round in 0..=self.max_tool_rounds {
            // The last round offers no tools so the model has to answer.
            let tools: &[ToolSpec] = if round < self.max_tool_rounds {
                &specs
            } else {
                &[]
            };
            let completion = self.stream_round(&messages, tools, events).await?;
            answer.push_str(&completion.content);
            if completion.tool_calls.is_empty() {
                break;
            }

            for call in &completion.tool_calls {
                info!(tool = %call.name, arguments = %call.arguments, "running tool");
                let _ = events
                    .send(AgentEvent::ToolStarted {
                        name: call.name.clone(),
                    })
                    .await;
            }
            let results: Vec<ChatMessage> = completion
                .tool_calls
                .iter()
                .map(|call| ChatMessage::tool_result(call, self.tools.execute(call)))
                .collect();
            messages.push(ChatMessage::assistant_with_tools(
                completion.content,
                completion.tool_calls,
            ));
            messages.extend(results);
        }
        Ok(answer)
    }

    /// One completion request, relaying its tokens as [`AgentEvent::Token`].
    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Completion, AgentError> {
        let (tx, mut rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let client = &self.client;
        let request = async move {
            let result = client.stream_chat(messages, tools, &tx).await;
            drop(tx);
            result
        };
        // Owns `rx` so a caller that stops listening also stops the stream.
        let relay = async move {
            while let Some(token) = rx.recv().await {
                if events.send(AgentEvent::Token(token)).await.is_err() {
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(request, relay);
        result
    }

    fn recent_history(&self) -> &[ChatMessage] {
        let max = self.max_history_turns * 2;
        let start = self.history.len().saturating_sub(max);
        &self.history[start..]
    }

    fn record(&mut self, user_message: &str, answer: &str) {
        self.history.push(ChatMessage::user(user_message));
        self.history.push(ChatMessage::assistant(answer));
        let max = self.max_history_turns * 2;
        if self.history.len() > max {
            let excess = self.history.len() - max;
            self.history.drain(..excess);
        }
    }
}

/// Whether a transcript asks to end the conversation.
pub fn is_exit_command(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .trim()
        .to_lowercase();
    EXIT_COMMANDS.contains(&normalized.as_str())
}
