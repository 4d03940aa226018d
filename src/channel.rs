//! Outbound notification delivery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{Chat, ChatId, Recipient};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// A chat the channel can deliver to; `id` is what groups register as
/// their destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver `body` to `destination_id`. A channel that is not ready yet
    /// logs and drops the message instead of failing.
    async fn send(&self, destination_id: &str, body: &str) -> Result<()>;

    /// Destinations known to the channel. Empty while it is not ready.
    async fn list_destinations(&self) -> Vec<Destination> {
        Vec::new()
    }
}

/// Telegram delivery. Destinations are numeric chat ids or `@channel` names.
#[derive(Clone)]
pub struct TelegramChannel {
    bot: Option<Bot>,
    ready: Arc<AtomicBool>,
    chats: Arc<Mutex<BTreeMap<i64, Destination>>>,
}

impl TelegramChannel {
    pub fn new(bot_token: Option<String>) -> Self {
        Self {
            bot: bot_token.map(Bot::new),
            ready: Arc::new(AtomicBool::new(false)),
            chats: Arc::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Check the token with `getMe`; the channel only sends once this succeeds.
    pub async fn authenticate(&self) -> Result<()> {
        let Some(bot) = &self.bot else {
            warn!("no telegram bot token configured; notifications will be dropped");
            return Ok(());
        };
        let me = bot.get_me().await.context("telegram getMe failed")?;
        self.ready.store(true, Ordering::Release);
        info!(bot = ?me.user.username, "telegram channel ready");
        Ok(())
    }

    /// Long-poll updates and remember every group or channel the bot is
    /// added to or hears from. The Bot API has no way to list chats, so this
    /// is how destinations become discoverable. Never returns.
    pub async fn track_chats(&self) {
        let Some(bot) = &self.bot else { return };
        let mut offset = 0;
        loop {
            match bot.get_updates().offset(offset).timeout(30).await {
                Ok(updates) => {
                    for update in updates {
                        offset = update.id + 1;
                        if let Some(chat) = update.chat() {
                            self.remember(chat).await;
                        }
                    }
                }
                Err(err) => {
                    warn!(?err, "telegram getUpdates failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn remember(&self, chat: &Chat) {
        if chat.is_private() {
            return;
        }
        let name = chat.title().or(chat.username()).unwrap_or_default();
        self.record(chat.id.0, name).await;
    }

    async fn record(&self, chat_id: i64, name: &str) {
        let destination = Destination {
            id: chat_id.to_string(),
            name: name.to_string(),
        };
        if self.chats.lock().await.insert(chat_id, destination).is_none() {
            debug!(chat_id, name, "discovered telegram chat");
        }
    }
}

pub fn parse_recipient(destination_id: &str) -> Recipient {
    let trimmed = destination_id.trim();
    match trimmed.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) if trimmed.starts_with('@') => Recipient::ChannelUsername(trimmed.to_string()),
        Err(_) => Recipient::ChannelUsername(format!("@{trimmed}")),
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    #[instrument(skip_all, fields(destination = %destination_id))]
    async fn send(&self, destination_id: &str, body: &str) -> Result<()> {
        let bot = match &self.bot {
            Some(bot) if self.is_ready() => bot,
            _ => {
                warn!("telegram channel not ready; dropping notification");
                return Ok(());
            }
        };
        bot.send_message(parse_recipient(destination_id), body)
            .await
            .context("telegram sendMessage failed")?;
        info!("notification sent");
        Ok(())
    }

    async fn list_destinations(&self) -> Vec<Destination> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.chats.lock().await.values().cloned().collect()
    }
}
