//! Chat Replay - Drive a chat session from the command line
//!
//! Sends each prompt in turn to an in-memory backend whose replies echo the
//! prompt back word by word, waits for every reply to stream in and go quiet,
//! then prints the resulting transcript.
//!
//! # Usage
//!
//! ```bash
//! # One conversation, two turns, JSON transcript
//! chat-replay "Hello" "How are you?"
//!
//! # Plain text, another model, shortest allowed quiet window
//! chat-replay --plain --model gpt-4o --quiet-ms 2000 "Hello"
//!
//! # Reload the first conversation from storage before printing
//! chat-replay --select chat_1 "Hello"
//!
//! # Verbose logging
//! RUST_LOG=chat_conductor=debug chat-replay "Hello"
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use chat_conductor::{
    default_config_path, load_config_from_path, ChatModel, ConfigOverrides, ConversationId,
    ConversationSummary, InMemoryBackend, Message, SendCompletion, SessionDriver,
};

/// Chat Replay - run prompts through the stream reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "chat-replay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CHAT_CONDUCTOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model to answer with
    #[arg(short = 'm', long)]
    model: Option<ChatModel>,

    /// Quiet window in milliseconds (2000-3000)
    #[arg(short = 'q', long, value_name = "MS")]
    quiet_ms: Option<u64>,

    /// Delay between reply chunks in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 30)]
    chunk_ms: u64,

    /// Conversation to select after all prompts were sent
    #[arg(short = 's', long, value_name = "ID")]
    select: Option<String>,

    /// Start a new conversation for every prompt
    #[arg(short = 'n', long)]
    new_each: bool,

    /// Print the conversation history list as well
    #[arg(short = 'l', long)]
    list: bool,

    /// Print plain text instead of JSON
    #[arg(short = 'p', long)]
    plain: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CHAT_CONDUCTOR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prompts to send, in order
    prompts: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    conversation_id: Option<&'a ConversationId>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    conversations: Option<Vec<ConversationSummary>>,
}

/// Initialize logging on stderr, so stdout carries only the transcript
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("chat_replay={level},chat_conductor={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn print_plain(report: &Report<'_>) {
    if let Some(id) = report.conversation_id {
        println!("# conversation {id}");
    }
    for message in report.messages {
        let who = if message.is_user { "you" } else { "assistant" };
        println!("{who}: {}", message.text);
    }
    if let Some(conversations) = &report.conversations {
        println!();
        println!("# history");
        for summary in conversations {
            println!("{}  {}", summary.id, summary.title);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ms) = args.quiet_ms {
        overrides = overrides.with_quiet_window_ms(ms);
    }
    if let Some(model) = args.model {
        overrides = overrides.with_default_model(model);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;

    info!(
        source = %config.source(),
        quiet_window = ?config.quiet_window,
        model = %config.default_model,
        "Configuration loaded"
    );

    let backend = Arc::new(InMemoryBackend::with_responder(
        InMemoryBackend::echo_responder(),
        Duration::from_millis(args.chunk_ms),
    ));
    let mut driver = SessionDriver::new(backend, config);

    for (turn, prompt) in args.prompts.iter().enumerate() {
        if args.new_each && turn > 0 {
            driver.start_new();
        }
        match driver.send_message(prompt).await {
            Ok(SendCompletion::Accepted {
                conversation_id, ..
            }) => {
                info!(conversation = %conversation_id, turn, "Prompt accepted");
            }
            Ok(completion) => {
                info!(?completion, turn, "Prompt not accepted");
            }
            Err(rejection) => {
                info!(%rejection, turn, "Prompt skipped");
                continue;
            }
        }
        driver.run_until_quiet().await;
    }

    if let Some(id) = args.select {
        driver.select_conversation(ConversationId::new(id)).await;
        driver.run_until_quiet().await;
    }

    let conversations = if args.list {
        Some(driver.list_conversations().await)
    } else {
        None
    };

    let report = Report {
        conversation_id: driver.session().current_conversation(),
        messages: driver.messages(),
        conversations,
    };

    if args.plain {
        print_plain(&report);
    } else {
        let json = serde_json::to_string_pretty(&report).context("Failed to encode transcript")?;
        println!("{json}");
    }

    Ok(())
}
