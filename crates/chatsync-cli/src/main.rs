//! # chatsync
//!
//! Terminal chat client built on the sync engine.
//!
//! It keeps the conversation list and the open conversation live over the
//! push channel, prints incoming messages as they arrive, and reads
//! commands from stdin (see `/help`).

mod commands;
mod error;
mod render;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatsync_client::{spawn_engine, ClientConfig, SessionContext, SyncEvent, SyncHandle};
use chatsync_net::{RestClient, WsConnector};
use chatsync_shared::constants::APP_NAME;
use chatsync_shared::{ChatResult, UserId};

use crate::commands::ReplCommand;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    // Logs go to stderr; stdout carries the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("chatsync_client=debug,chatsync_net=debug,warn")
        }))
        .with_writer(std::io::stderr)
        .init();

    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Build transports
    // -----------------------------------------------------------------------
    let api = Arc::new(RestClient::new(&config.api_url, config.request_timeout)?);
    let connector = Arc::new(WsConnector::new(&config.ws_url)?);

    // -----------------------------------------------------------------------
    // 4. Recover the session, if one was handed to us
    // -----------------------------------------------------------------------
    let session = SessionContext::default();
    match (
        std::env::var("CHATSYNC_TOKEN").ok(),
        std::env::var("CHATSYNC_USER_ID").ok(),
    ) {
        (Some(token), Some(user)) if !token.is_empty() && !user.is_empty() => {
            session.begin(token, UserId::new(user));
        }
        _ => warn!("CHATSYNC_TOKEN / CHATSYNC_USER_ID not set; use /login"),
    }

    // -----------------------------------------------------------------------
    // 5. Start the sync engine and the event printer
    // -----------------------------------------------------------------------
    let handle = spawn_engine(config, api, connector, session);
    tokio::spawn(print_events(handle.subscribe()));
    println!("{}", commands::HELP);

    // -----------------------------------------------------------------------
    // 6. Read commands until EOF, /quit or Ctrl+C
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !run_command(&handle, &line).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = render::event_line(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report<T>(result: ChatResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            eprintln!("error: {e}");
            None
        }
    }
}

/// Execute one prompt line. Returns `false` when the user asked to quit.
async fn run_command(handle: &SyncHandle, line: &str) -> bool {
    let command = match commands::parse(line) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}");
            return true;
        }
    };

    match command {
        ReplCommand::Empty => {}
        ReplCommand::Help => println!("{}", commands::HELP),
        ReplCommand::Quit => return false,

        ReplCommand::List => {
            for line in render::directory_lines(&handle.directory().borrow()) {
                println!("{line}");
            }
        }

        ReplCommand::Open(id) => {
            if report(handle.open_conversation(id).await).is_some() {
                if let Some(log) = handle.active_log().borrow().as_ref() {
                    println!("== {} ({} messages)", log.conversation_id, log.messages.len());
                    for message in &log.messages {
                        println!("{}", render::message_line(message));
                    }
                }
            }
        }

        ReplCommand::Close => {
            report(handle.close_conversation().await);
        }

        ReplCommand::Older => {
            if let Some(added) = report(handle.load_older().await) {
                println!("-- loaded {added} older messages");
            }
        }

        ReplCommand::Search(text) => {
            let active = handle.directory().borrow().active.clone();
            let Some(conversation_id) = active else {
                eprintln!("Open a conversation first");
                return true;
            };
            if let Some(hits) = report(handle.search_messages(conversation_id, text).await) {
                println!("-- {} matches", hits.len());
                for message in &hits {
                    println!("{}", render::message_line(message));
                }
            }
        }

        ReplCommand::New { name, members } => {
            if let Some(conversation) = report(handle.create_conversation(name, members).await) {
                println!("-- created {}", render::conversation_line(&conversation, false));
            }
        }

        ReplCommand::Read => {
            let ids: Vec<_> = handle
                .active_log()
                .borrow()
                .as_ref()
                .map(|log| log.messages.iter().map(|m| m.id.clone()).collect())
                .unwrap_or_default();
            if ids.is_empty() {
                eprintln!("Nothing to mark");
            } else if report(handle.mark_read(ids).await).is_some() {
                println!("-- marked as read");
            }
        }

        ReplCommand::Status => {
            let status = *handle.status().borrow();
            match handle.session().current() {
                Some(session) => println!("-- {status}, signed in as {}", session.user_id),
                None => println!("-- {status}, signed out"),
            }
        }

        ReplCommand::Reconnect => {
            report(handle.reconnect().await);
        }

        ReplCommand::Login { token, user_id } => {
            handle.session().begin(token, user_id);
        }

        ReplCommand::Logout => {
            if handle.session().clear().is_none() {
                eprintln!("Not signed in");
            }
        }

        ReplCommand::Send(text) => {
            report(handle.send_message(text).await);
        }
    }
    true
}
