mod config;
mod logging;

use std::{process::ExitCode, sync::Arc, time::Duration};

use chat_core::{ChatCommand, ChatEvent, ConversationKey};
use chat_platform::{BearerToken, InMemoryTokenStore, SessionTokens};
use chat_realtime::{
    ChatApi, HttpChatApi, RuntimeDeps, StompTransport, StompTransportConfig, spawn_runtime,
};
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::{error, info, warn};

use crate::config::SmokeConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "smoke session failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bearer = BearerToken::new(config.token.clone())?;
    let tokens = Arc::new(InMemoryTokenStore::default());
    SessionTokens::new(Arc::clone(&tokens), config.user_id).save(&bearer)?;

    let api = Arc::new(HttpChatApi::new(config.api_url.clone(), REQUEST_TIMEOUT)?);
    let mut transport_config = StompTransportConfig::new(config.ws_url.clone());
    if let Some(ms) = config.heartbeat_ms {
        transport_config.heartbeat = Duration::from_millis(ms);
    }

    let handle = spawn_runtime(
        config.runtime_config(),
        RuntimeDeps {
            api: api.clone(),
            transport: Arc::new(StompTransport::new(transport_config)),
            tokens,
        },
    );
    let mut events = handle.subscribe();

    info!(user_id = config.user_id, api = %config.api_url, ws = %config.ws_url, "starting smoke session");
    handle.send(ChatCommand::Connect).await?;
    handle.send(ChatCommand::LoadConversations).await?;
    if let Some(peer_id) = config.peer_id {
        match api
            .fetch_unread_count(&bearer, peer_id, config.user_id)
            .await
        {
            Ok(unread) => info!(peer_id, unread, "unread before opening"),
            Err(err) => warn!(peer_id, code = %err.code, "unread count unavailable"),
        }
        handle.send(ChatCommand::OpenConversation { peer_id }).await?;
        if let Some(text) = config.message.clone() {
            handle
                .send(ChatCommand::SendMessage {
                    conversation: ConversationKey::new(config.user_id, peer_id)?,
                    client_txn_id: uuid::Uuid::new_v4().to_string(),
                    text,
                })
                .await?;
        }
    }

    let mut connected = false;
    let _ = timeout(config.run_for, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if matches!(event, ChatEvent::ConnectResult { success: true, .. }) {
                        connected = true;
                    }
                    log_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;

    handle.send(ChatCommand::Disconnect).await?;
    handle.shutdown();

    if connected {
        info!("smoke session finished");
        Ok(())
    } else {
        Err("push channel never connected".into())
    }
}

fn log_event(event: &ChatEvent) {
    match event {
        ChatEvent::ConversationsUpdated { conversations } => {
            info!(count = conversations.len(), "conversations updated");
            for summary in conversations {
                info!(
                    conversation = %summary.id,
                    with = %summary.other_user_name,
                    unread = summary.unread_count,
                    last = summary.last_message_text.as_deref().unwrap_or(""),
                    "conversation"
                );
            }
        }
        ChatEvent::TimelineUpdated {
            conversation,
            entries,
        } => info!(%conversation, entries = entries.len(), "timeline updated"),
        ChatEvent::Failure { code, message, .. } => warn!(code, message, "runtime failure"),
        other => info!(event = ?other, "event"),
    }
}
