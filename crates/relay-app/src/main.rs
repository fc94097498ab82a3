//! Relay application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Wire the broker connection and history service into a sync engine
//! 4. Run the interactive terminal loop until `/quit` or end of input

mod cli;
mod console;
mod offline;

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use relay_core::config::RelayConfig;
use relay_core::history::HistoryProvider;
use relay_core::types::ConversationId;
use relay_history::HttpHistory;
use relay_sync::{Rejection, SendOutcome, SyncEngine};
use relay_transport::{Connection, Connector, WebSocketConnector};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use cli::CliArgs;
use console::{parse_input, Input, Transcript, HELP};

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(config: &RelayConfig, offline: bool) -> Result<SyncEngine, Box<dyn std::error::Error>> {
    let (connector, history): (Arc<dyn Connector>, Arc<dyn HistoryProvider>) = if offline {
        let (broker, history) = offline::backend();
        tracing::info!("Offline mode: in-process broker with echo assistant");
        (Arc::new(broker), Arc::new(history))
    } else {
        let cookie = config.transport.session_cookie.clone();
        let history = HttpHistory::new(&config.history, cookie.as_deref())?
            .with_server_offset(config.sync.server_offset());
        let connector = WebSocketConnector::new(config.transport.endpoint.clone())
            .with_session_cookie(cookie);
        tracing::info!(
            endpoint = %config.transport.endpoint,
            api = %config.history.base_url,
            "Using remote chat server"
        );
        (Arc::new(connector), Arc::new(history))
    };
    let connection = Connection::new(config.transport.clone(), connector);
    Ok(SyncEngine::new(connection, history, &config.sync))
}

/// Print events for the focused conversation as they arrive.
async fn render_events(engine: Arc<SyncEngine>) {
    let mut events = engine.events();
    let mut transcript = Transcript::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Renderer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let focused = engine.focused();
        if let Some(conversation_id) = event.conversation_id() {
            if focused.as_ref() != Some(conversation_id) {
                continue;
            }
        }
        let messages = focused
            .map(|id| engine.store().messages(&id))
            .unwrap_or_default();
        if let Some(text) = transcript.render(&event, &messages) {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }
}

async fn open(engine: &SyncEngine, id: &ConversationId) {
    match engine.focus(id).await {
        Ok(()) => println!("-- conversation {id} --"),
        Err(e) => println!("! could not open {id}: {e}"),
    }
}

/// The conversation to open first: the requested one, else the most recent,
/// else a new one.
async fn initial_conversation(
    engine: &SyncEngine,
    requested: Option<&str>,
) -> relay_core::error::Result<ConversationId> {
    if let Some(id) = requested {
        return Ok(ConversationId::new(id));
    }
    let directory = engine.refresh_directory().await?;
    match directory.first() {
        Some(latest) => Ok(latest.id.clone()),
        None => engine.create_conversation().await,
    }
}

fn print_directory(engine: &SyncEngine) {
    let focused = engine.focused();
    for entry in engine.directory() {
        let marker = if focused.as_ref() == Some(&entry.id) { '*' } else { ' ' };
        println!("{marker} {:>4}  {}", entry.id, entry.title);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = RelayConfig::load_or_default(&config_file);
    args.apply(&mut config);

    // Tracing.
    init_tracing(&config.general.log_level);
    tracing::info!("Starting Relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");

    let engine = Arc::new(build_engine(&config, args.offline)?);
    let renderer = tokio::spawn(render_events(Arc::clone(&engine)));

    if let Err(e) = engine.start().await {
        tracing::warn!(error = %e, "Initial connection failed; use /connect to retry");
    }

    let mut current = match initial_conversation(&engine, args.conversation.as_deref()).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(error = %e, "Could not load conversations");
            None
        }
    };
    if let Some(ref id) = current {
        open(&engine, id).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = parse_input(&line) else { continue };
        match input {
            Input::Quit => break,
            Input::Help => println!("{HELP}"),
            Input::Invalid(reason) => println!("! {reason}"),
            Input::Connect => match engine.connection().connect().await {
                Ok(()) => {}
                Err(e) => println!("! connection failed: {e}"),
            },
            Input::List => match engine.refresh_directory().await {
                Ok(_) => print_directory(&engine),
                Err(e) => println!("! {e}"),
            },
            Input::New => match engine.create_conversation().await {
                Ok(id) => {
                    open(&engine, &id).await;
                    current = Some(id);
                }
                Err(e) => println!("! {e}"),
            },
            Input::Switch(id) => {
                open(&engine, &id).await;
                current = Some(id);
            }
            Input::Title(title) => {
                let Some(ref id) = current else {
                    println!("! no conversation open");
                    continue;
                };
                if let Err(e) = engine.rename_conversation(id, &title).await {
                    println!("! {e}");
                }
            }
            Input::Delete => {
                let Some(id) = current.take() else {
                    println!("! no conversation open");
                    continue;
                };
                match engine.delete_conversation(&id).await {
                    Ok(()) => println!("-- deleted {id}; /list or /new to continue --"),
                    Err(e) => {
                        println!("! {e}");
                        current = Some(id);
                    }
                }
            }
            Input::Message(text) => {
                let Some(ref id) = current else {
                    println!("! no conversation open; /new to start one");
                    continue;
                };
                match engine.send(id, &text, None) {
                    SendOutcome::Sent(_) | SendOutcome::Failed(_) => {}
                    SendOutcome::Rejected(Rejection::InFlight) => {
                        println!("! still sending the previous message")
                    }
                    SendOutcome::Rejected(Rejection::NotConnected) => {
                        println!("! not connected; /connect to retry")
                    }
                    SendOutcome::Rejected(Rejection::TooLong) => {
                        println!(
                            "! message longer than {} characters",
                            config.sync.max_message_chars
                        )
                    }
                    SendOutcome::Rejected(Rejection::Empty) => {}
                }
            }
        }
    }

    engine.shutdown();
    renderer.abort();
    tracing::info!("Relay stopped");
    Ok(())
}
