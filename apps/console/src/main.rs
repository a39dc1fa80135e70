use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::DeliveryState;
use sync_core::{
    load_settings, load_settings_from, ConversationSummary, HttpSnapshotApi, SyncEngine,
    SyncUpdate, SyncView, WebSocketChannel,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ConsoleCommand, HELP};

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `sync.toml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(token) = args.token {
        settings.bearer_token = Some(token);
    }

    let api = Arc::new(HttpSnapshotApi::from_settings(&settings));
    let channel = Arc::new(WebSocketChannel::from_settings(&settings)?);
    let engine = SyncEngine::start(&settings, api, channel)
        .await
        .with_context(|| format!("failed to load conversations from {}", settings.server_url))?;

    print_overview(&engine.view());
    println!("type /help for commands");

    let mut updates = engine.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => print_update(&engine.view(), update),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: update stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match commands::parse(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = run_command(&engine, command).await {
                            println!("error: {err}");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn run_command(engine: &SyncEngine, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::List => print_overview(&engine.view()),
        ConsoleCommand::Open(conversation_id) => {
            let view = engine.view();
            let conversation = view
                .conversation(&conversation_id)
                .with_context(|| format!("no conversation {conversation_id}"))?;
            print_conversation(conversation);
            engine.mark_conversation_seen(&conversation_id)?;
        }
        ConsoleCommand::Send {
            conversation_id,
            text,
        } => {
            engine.notify_stop_typing(&conversation_id)?;
            let correlation_id = engine.send_message(&conversation_id, text).await?;
            println!("queued {correlation_id}");
        }
        ConsoleCommand::Retry(correlation_id) => {
            let retry = engine.retry_send(&correlation_id).await?;
            println!("retrying as {retry}");
        }
        ConsoleCommand::Start { user_id, text } => {
            let conversation_id = engine.start_conversation(&user_id, text).await?;
            println!("started {conversation_id}");
        }
        ConsoleCommand::Typing(conversation_id) => engine.notify_typing(&conversation_id)?,
        ConsoleCommand::StopTyping(conversation_id) => engine.notify_stop_typing(&conversation_id)?,
        ConsoleCommand::ReadAll => engine.mark_all_read()?,
        ConsoleCommand::Resync => engine.resync()?,
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_overview(view: &SyncView) {
    let stale = if view.presence_stale { " (presence stale)" } else { "" };
    println!(
        "{} [{:?}]{stale}, {} unread",
        view.current_user.display_name,
        view.mode,
        view.unread_total()
    );
    for conversation in &view.conversations {
        let online = if conversation.counterpart_online { '*' } else { ' ' };
        let last = conversation
            .last_message()
            .map(|message| message.text.as_str())
            .unwrap_or("");
        println!(
            "{online} {:<12} {:<16} {:>3} {last}",
            conversation.id.as_str(),
            conversation.title,
            conversation.unread
        );
    }
}

fn print_conversation(conversation: &ConversationSummary) {
    println!("-- {} ({})", conversation.title, conversation.id);
    for message in &conversation.messages {
        let author = if message.from_me { "me" } else { message.sender_id.as_str() };
        let status = match (message.delivery, message.from_me, message.seen) {
            (DeliveryState::Pending, _, _) => " [sending]".to_string(),
            (DeliveryState::Failed, _, _) => format!(
                " [failed, /retry {}]",
                message
                    .correlation_id
                    .as_ref()
                    .map(|id| id.as_str())
                    .unwrap_or("?")
            ),
            (DeliveryState::Sent, true, true) => " [seen]".to_string(),
            (DeliveryState::Sent, _, _) => String::new(),
        };
        println!(
            "{} {author}: {}{status}",
            message.created_at.format("%H:%M"),
            message.text
        );
    }
}

fn print_update(view: &SyncView, update: SyncUpdate) {
    match update {
        SyncUpdate::ConversationChanged(conversation_id) => {
            if let Some(message) = view
                .conversation(&conversation_id)
                .and_then(|conversation| conversation.last_message())
            {
                if !message.from_me {
                    println!("[{conversation_id}] {}: {}", message.sender_id, message.text);
                }
            }
        }
        SyncUpdate::TypingChanged(conversation_id) => {
            if let Some(user_id) = view
                .conversation(&conversation_id)
                .and_then(|conversation| conversation.typing.as_ref())
            {
                println!("[{conversation_id}] {user_id} is typing...");
            }
        }
        SyncUpdate::PresenceChanged => {
            let online: Vec<&str> = view.online.iter().map(|user_id| user_id.as_str()).collect();
            println!("online: {}", online.join(", "));
        }
        SyncUpdate::ModeChanged(mode) => println!("connection: {mode:?}"),
        SyncUpdate::SendFailed {
            correlation_id,
            reason,
        } => println!("send failed ({reason}); /retry {correlation_id}"),
        SyncUpdate::Resynced {
            conversations,
            stale,
        } => println!(
            "resynced {conversations} conversations{}",
            if stale { " (kept newer local messages)" } else { "" }
        ),
        SyncUpdate::Error(message) => println!("error: {message}; /resync to re-fetch"),
        SyncUpdate::UsersChanged => {}
    }
}
