use std::time::Duration;

use anyhow::Result;
use chat_core::{
    config::load_settings, types::DeliveryState, ActiveChatView, AssistantChat, ChatEvent,
    LocalMessageId, RenderedMessage,
};
use clap::Parser;
use shared::domain::ConversationId;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Talk to the assistant from a terminal")]
struct Args {
    /// Overrides `api_base_url` from chat.toml and the environment.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    realtime_url: Option<String>,
    /// Send everything through the REST fallback.
    #[arg(long)]
    no_realtime: bool,
    #[arg(long)]
    search: Option<String>,
    #[arg(long, conflicts_with = "new_conversation")]
    conversation: Option<i64>,
    #[arg(long)]
    new_conversation: bool,
    #[arg(long)]
    message: Option<String>,
    /// How long to wait for a send to be confirmed.
    #[arg(long, default_value_t = 10)]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.api_base_url {
        settings.api_base_url = url;
    }
    if let Some(url) = args.realtime_url {
        settings.realtime_url = Some(url);
    }
    if args.no_realtime {
        settings.realtime_enabled = false;
    }
    info!(api = %settings.api_base_url, "chat_cli: starting");

    let chat = AssistantChat::from_settings(&settings)?;
    chat.mount().await;

    if let Some(term) = args.search {
        if let Err(err) = chat.set_search(term).await {
            warn!("chat_cli: search failed: {err}");
        }
    }
    if let Some(id) = args.conversation {
        chat.select_conversation(ConversationId(id)).await?;
    } else if args.new_conversation {
        chat.start_new_conversation().await;
    }

    if let Some(text) = args.message {
        let mut events = chat.subscribe_events();
        let local_id = chat.send_message(text, Vec::new()).await?;
        wait_for_send(&chat, &mut events, local_id, Duration::from_secs(args.wait_secs)).await;
    }

    print_view(&chat.view().await);
    chat.unmount().await;
    Ok(())
}

async fn wait_for_send(
    chat: &AssistantChat,
    events: &mut broadcast::Receiver<ChatEvent>,
    local_id: LocalMessageId,
    limit: Duration,
) {
    let settled = tokio::time::timeout(limit, async {
        loop {
            if !chat.view().await.is_sending {
                return;
            }
            match events.recv().await {
                Ok(ChatEvent::SendFailed {
                    local_id: failed,
                    reason,
                }) if failed == local_id => {
                    warn!("chat_cli: message not delivered: {reason}");
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
    .await;
    if settled.is_err() {
        warn!(%local_id, "chat_cli: still waiting for confirmation, giving up");
    }
}

fn print_view(view: &ActiveChatView) {
    println!("connection: {:?}", view.connection);
    if let Some(err) = &view.roster_error {
        println!("roster unavailable: {err}");
    }
    println!("conversations:");
    for conversation in &view.roster {
        let marker = if Some(conversation.conversation_id) == view.conversation_id {
            '*'
        } else {
            ' '
        };
        println!(
            "{marker} [{}] {} | {}",
            conversation.conversation_id,
            conversation.title,
            conversation.last_message_preview.as_deref().unwrap_or("")
        );
    }

    match view.conversation_id {
        Some(id) => println!("\nmessages in conversation {id}:"),
        None => println!("\nnew conversation:"),
    }
    if let Some(err) = &view.history_error {
        println!("(history may be stale: {err})");
    }
    for message in &view.messages {
        println!("{}", format_message(message));
    }
}

fn format_message(message: &RenderedMessage) -> String {
    let status = match &message.delivery {
        DeliveryState::Delivered => String::new(),
        DeliveryState::Sending => " (sending)".to_string(),
        DeliveryState::Failed { reason } => format!(" (failed: {reason})"),
    };
    format!(
        "[{}] {}: {}{status}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.sender.label(),
        message.content
    )
}
