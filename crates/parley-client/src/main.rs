//! # parley
//!
//! Line-oriented terminal chat against a Parley server.
//!
//! Every line typed is sent as a message and the reply is printed as it
//! streams in. Lines starting with `/` are commands:
//! - `/new` starts a fresh conversation
//! - `/open <id>` loads an existing one
//! - `/retry` resends the last failed message
//! - `/history` prints the transcript
//! - `/quit` exits

use std::io::Write;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parley_client::events::TranscriptEvent;
use parley_client::reconciler::Delivery;
use parley_client::{ChatSession, ClientConfig, ExchangeOutcome};
use parley_shared::constants::APP_NAME;
use parley_shared::types::ConversationId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,parley_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // -----------------------------------------------------------------------
    // 2. Load configuration and connect
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    tracing::debug!(?config, "Loaded configuration");

    let session = ChatSession::new(&config)?;
    session
        .api()
        .health()
        .await
        .with_context(|| format!("server at {} is not reachable", config.server_url))?;

    tokio::spawn(render(session.subscribe()));

    let mut conversation = match std::env::args().nth(1) {
        Some(raw) => {
            let id: ConversationId = raw.parse().context("invalid conversation id")?;
            session.load_conversation(id).await?;
            print_history(&session, id);
            id
        }
        None => session.start_conversation().await?,
    };
    println!("{APP_NAME} conversation {conversation}. Type /quit to exit.");

    // -----------------------------------------------------------------------
    // 3. Read lines until EOF or /quit
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));

        let result = match command {
            "" => continue,
            "/quit" => break,
            "/new" => match session.start_conversation().await {
                Ok(id) => {
                    conversation = id;
                    println!("Conversation {id}");
                    continue;
                }
                Err(e) => Err(e),
            },
            "/open" => match arg.trim().parse::<ConversationId>() {
                Ok(id) => match session.load_conversation(id).await {
                    Ok(()) => {
                        conversation = id;
                        print_history(&session, id);
                        continue;
                    }
                    Err(e) => Err(e),
                },
                Err(_) => {
                    eprintln!("usage: /open <conversation id>");
                    continue;
                }
            },
            "/history" => {
                print_history(&session, conversation);
                continue;
            }
            "/retry" => session.retry(conversation).await,
            _ => session.send(conversation, line).await,
        };

        match result {
            Ok(ExchangeOutcome::Finalized { .. }) => {}
            Ok(ExchangeOutcome::Failed { failure, .. }) if failure.is_retryable() => {
                eprintln!("(type /retry or send the same message again)");
            }
            Ok(ExchangeOutcome::Failed { .. }) => {}
            Err(e) => eprintln!("error: {e}"),
        }
    }

    Ok(())
}

/// Print transcript events as they arrive.
async fn render(mut events: mpsc::UnboundedReceiver<TranscriptEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TranscriptEvent::FragmentAppended { content, .. } => {
                print!("{content}");
                let _ = stdout.flush();
            }
            TranscriptEvent::ExchangeFinalized { .. } => println!(),
            TranscriptEvent::ExchangeFailed {
                reason, retryable, ..
            } => {
                println!();
                eprintln!("failed: {reason}{}", if retryable { "" } else { " (not retryable)" });
            }
            TranscriptEvent::TitleChanged { title, .. } => println!("[{title}]"),
            TranscriptEvent::EntryAdded { .. } | TranscriptEvent::ExchangeRetried { .. } => {}
        }
    }
}

fn print_history(session: &ChatSession, conversation: ConversationId) {
    if let Some(title) = session.title(conversation) {
        println!("# {title}");
    }
    for entry in session.entries(conversation) {
        let marker = match &entry.delivery {
            Delivery::Complete => "",
            Delivery::Optimistic | Delivery::Streaming => " …",
            Delivery::Failed { .. } => " (failed)",
        };
        println!("{}: {}{marker}", entry.author.as_str(), entry.content);
    }
}
