use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{
    config, ApiClient, ChannelLifecycleManager, NotificationEvent, WebSocketConnector,
};
use shared::domain::Role;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the API url from client.toml / environment.
    #[arg(long)]
    api_url: Option<String>,
    /// Role to sign in as: buyer, seller, or admin.
    #[arg(long, default_value = "buyer")]
    role: String,
}

fn parse_role(raw: &str) -> Result<Role> {
    match raw.to_ascii_lowercase().as_str() {
        "buyer" => Ok(Role::Buyer),
        "seller" => Ok(Role::Seller),
        "admin" => Ok(Role::Admin),
        other => anyhow::bail!("unknown role '{other}', expected buyer, seller, or admin"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    let role = parse_role(&args.role)?;

    let client = ApiClient::new(&settings.api_url)?;
    let connector = Arc::new(WebSocketConnector::new(settings.socket_url()?));
    let manager = ChannelLifecycleManager::new(connector, client.actor_updates());
    let _lifecycle = manager.spawn();
    let mut notifications = manager.subscribe();

    let profile = client.resolve_identity(role).await?;
    println!("signed in as {} ({})", profile.name, profile.role);

    for conversation in client.fetch_conversations().await? {
        println!(
            "conversation {} with {}: {} unseen",
            conversation.conversation_id, conversation.peer_name, conversation.unseen_count
        );
    }

    println!("watching for unseen-count updates, ctrl-c to quit");
    while let Ok(event) = notifications.recv().await {
        match event {
            NotificationEvent::ChannelReady => println!("notification channel ready"),
            NotificationEvent::UnseenCountChanged {
                conversation_id,
                count,
            } => println!("conversation {conversation_id}: {count} unseen"),
            NotificationEvent::ChannelClosed => println!("notification channel closed"),
        }
    }

    Ok(())
}
