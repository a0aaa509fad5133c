//! Text-only chat with the voice agent on stdin/stdout, for trying a model
//! and its tools without audio.
//!
//! Commands: `/clear` forgets the conversation, `/stats` prints agent stats,
//! and an exit word (`exit`, `quit`, `goodbye`, `stop`) ends the session.

use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use voxline_agent::{is_exit_command, AgentEvent};
use voxline_server::{build_agent, config};

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOXLINE_CONFIG_PATH").ok())
        .unwrap_or_else(|| "config.toml".to_string());
    let config = config::load_config(Some(&path)).expect("failed to load configuration");

    // Logs go to stderr so they do not interleave with the conversation.
    let filter = EnvFilter::try_new(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut agent = build_agent(&config).expect("failed to create agent");
    let stats = agent.stats();
    println!(
        "voxline chat ({} / {}). Tools: {}. Type 'exit' to quit.",
        stats.provider,
        stats.model,
        stats.tool_names.join(", ")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("failed to read input: {}", e);
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit_command(input) {
            println!("Goodbye!");
            break;
        }
        match input {
            "/clear" => {
                agent.clear_history();
                println!("(history cleared)");
                continue;
            }
            "/stats" => {
                match serde_json::to_string_pretty(&agent.stats()) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("failed to render stats: {}", e),
                }
                continue;
            }
            _ => {}
        }

        let (tx, mut rx) = mpsc::channel(64);
        let printer = async {
            print!("agent> ");
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::Token(token) => print!("{}", token),
                    AgentEvent::ToolStarted { name } => eprint!("[{}] ", name),
                }
                let _ = std::io::stdout().flush();
            }
            println!();
        };
        let respond = async {
            agent.respond(input, &tx).await;
            drop(tx);
        };
        tokio::join!(respond, printer);
    }
}
