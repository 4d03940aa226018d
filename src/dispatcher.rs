use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::channel::NotificationChannel;
use crate::model::ContentItem;
use crate::queue::MessageHandler;
use crate::storage::StorageFactory;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Queue consumer: resolves the groups for an item's platform and sends one
/// notification per group.
pub struct Dispatcher {
    storage: Arc<StorageFactory>,
    channel: Arc<dyn NotificationChannel>,
}

impl Dispatcher {
    pub fn new(storage: Arc<StorageFactory>, channel: Arc<dyn NotificationChannel>) -> Self {
        Self { storage, channel }
    }

    /// Errors only when the group lookup fails. Per-group send failures are
    /// logged and counted.
    #[instrument(skip_all, fields(item_id = %item.id, platform = %item.platform))]
    pub async fn dispatch(&self, item: &ContentItem) -> Result<DispatchReport> {
        let storage = self.storage.get_storage().await;
        let groups = storage
            .list_groups(Some(item.platform))
            .await
            .context("failed to load notification groups")?;

        let mut report = DispatchReport::default();
        if groups.is_empty() {
            info!("no notification groups for platform; dropping item");
            return Ok(report);
        }

        let body = format_notification(item);
        for group in &groups {
            info!(group = %group.name, destination = %group.destination_id, "sending notification");
            match self.channel.send(&group.destination_id, &body).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(?err, group = %group.name, "notification delivery failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, item: ContentItem) -> Result<()> {
        info!(item_id = %item.id, username = %item.username, "received content item");
        self.dispatch(&item).await.map(|_| ())
    }
}

/// Deterministic message body for an item.
pub fn format_notification(item: &ContentItem) -> String {
    format!(
        "🚨 New {} post\n\n👤 {}\n📄 {}\n\n🔗 {}\n⏰ {}",
        item.platform.label(),
        item.username,
        item.content,
        item.url,
        item.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}
