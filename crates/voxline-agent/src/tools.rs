//! Tools the model can call, and the built-in demo set.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use voxline_types::{ToolCall, ToolSpec};

type Handler = Arc<dyn Fn(&Value) -> String + Send + Sync>;

const WEATHER_CONDITIONS: [&str; 5] = ["sunny", "cloudy", "rainy", "partly cloudy", "stormy"];

/// A named tool: its declaration plus the function that runs it.
#[derive(Clone)]
pub struct Tool {
    spec: ToolSpec,
    handler: Handler,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool").field("name", &self.spec.name).finish()
    }
}

impl Tool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            handler: Arc::new(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    pub fn call(&self, arguments: &Value) -> String {
        (self.handler)(arguments)
    }
}

/// Ordered set of tools, unique by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `get_random_number`, `calculate_fibonacci`
    /// and `get_weather`.
    pub fn with_mock_tools() -> Self {
        let mut registry = Self::new();
        for tool in mock_tools() {
            registry.add(tool);
        }
        registry
    }

    /// Adds a tool. Returns `false` if one with the same name is present.
    pub fn add(&mut self, tool: Tool) -> bool {
        if self.tools.iter().any(|t| t.name() == tool.name()) {
            return false;
        }
        self.tools.push(tool);
        true
    }

    /// Removes a tool by name. Returns `true` if it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tools.len();
        self.tools.retain(|t| t.name() != name);
        self.tools.len() < before
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec().clone()).collect()
    }

    /// Runs a call. Unknown tools produce a message for the model rather
    /// than an error.
    pub fn execute(&self, call: &ToolCall) -> String {
        match self.tools.iter().find(|t| t.name() == call.name) {
            Some(tool) => tool.call(&call.arguments),
            None => format!("Unknown tool: {}", call.name),
        }
    }
}

pub fn mock_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            "get_random_number",
            "Get a random number between 1-100.",
            json!({ "type": "object", "properties": {} }),
            |_| random_number(),
        ),
        Tool::new(
            "calculate_fibonacci",
            "Calculate the nth Fibonacci number (1-20 only).",
            json!({
                "type": "object",
                "properties": {
                    "n": { "type": "integer", "description": "Position in the Fibonacci sequence, 1-20" }
                },
                "required": ["n"]
            }),
            |args| fibonacci_answer(args.get("n").unwrap_or(&Value::Null)),
        ),
        Tool::new(
            "get_weather",
            "Get weather information for a city.",
            json!({
                "type": "object",
                "properties": {
                    "city": { "type": "string", "description": "The city to get weather for" }
                },
                "required": ["city"]
            }),
            |args| weather(args.get("city").and_then(Value::as_str).unwrap_or("your area")),
        ),
    ]
}

fn random_number() -> String {
    let number = rand::thread_rng().gen_range(1..=100);
    format!("Here's your random number: {}", number)
}

fn fibonacci_answer(n: &Value) -> String {
    // Models sometimes send numbers as strings.
    let parsed = match n {
        Value::Number(num) => num
            .as_i64()
            .or_else(|| num.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let Some(n) = parsed else {
        return "Please provide a valid number.".to_string();
    };
    if !(1..=20).contains(&n) {
        return "Please provide a number between 1 and 20.".to_string();
    }
    format!("The {}th Fibonacci number is {}", n, fibonacci(n as u32))
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        (a, b) = (b, a + b);
    }
    b
}

fn weather(city: &str) -> String {
    let mut rng = rand::thread_rng();
    let condition = WEATHER_CONDITIONS.choose(&mut rng).copied().unwrap_or("sunny");
    let temperature = rng.gen_range(15..35);
    format!(
        "The weather in {} is currently {} with a temperature of {}°C",
        city, condition, temperature
    )
}
