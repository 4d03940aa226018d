use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::model::MonitoredAccount;
use crate::queue::{QueueBackend, QueueFactory};
use crate::source::SourceRegistry;
use crate::storage::{StorageBackend, StorageFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub startup_delay: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub published: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountOutcome {
    Unchanged,
    Published,
    NoSource,
}

/// Periodically checks every monitored account for new content.
pub struct Poller {
    storage: Arc<StorageFactory>,
    queue: Arc<QueueFactory>,
    sources: SourceRegistry,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        storage: Arc<StorageFactory>,
        queue: Arc<QueueFactory>,
        sources: SourceRegistry,
        config: PollerConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            sources,
            config,
        }
    }

    /// Run cycles forever. The next cycle is scheduled only after the
    /// previous one returns, so cycles never overlap.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            sources = self.sources.len(),
            "starting poller"
        );
        tokio::time::sleep(self.config.startup_delay).await;
        loop {
            let report = self.poll_once().await;
            info!(
                checked = report.checked,
                published = report.published,
                failed = report.failed,
                "poll cycle finished"
            );
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// One pass over all accounts, strictly sequential.
    #[instrument(skip_all)]
    pub async fn poll_once(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let storage = self.storage.get_storage().await;
        let queue = self.queue.get_queue().await;

        let accounts = match storage.list_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => {
                error!(?err, "failed to list monitored accounts");
                return report;
            }
        };

        for account in &accounts {
            report.checked += 1;
            match self.check_account(storage.as_ref(), queue.as_ref(), account).await {
                Ok(AccountOutcome::Published) => report.published += 1,
                Ok(AccountOutcome::Unchanged) => {}
                Ok(AccountOutcome::NoSource) => {
                    warn!(platform = %account.platform, username = %account.username, "no content source for platform");
                }
                Err(err) => {
                    error!(?err, account_id = account.id, username = %account.username, "account check failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn check_account(
        &self,
        storage: &dyn StorageBackend,
        queue: &dyn QueueBackend,
        account: &MonitoredAccount,
    ) -> Result<AccountOutcome> {
        let Some(source) = self.sources.get(account.platform) else {
            return Ok(AccountOutcome::NoSource);
        };
        let last_seen = account.last_seen_item_id.as_deref();
        let Some(item) = source.check_latest(&account.username, last_seen).await else {
            return Ok(AccountOutcome::Unchanged);
        };
        if last_seen == Some(item.id.as_str()) {
            debug!(item_id = %item.id, "source returned the last seen item");
            return Ok(AccountOutcome::Unchanged);
        }

        info!(username = %account.username, item_id = %item.id, "new item found");
        // The account is only marked as seen once the item is on the queue.
        queue
            .publish(&item)
            .await
            .context("failed to publish content item")?;
        storage
            .update_last_seen_item_id(account.id, &item.id)
            .await
            .context("failed to record last seen item")?;
        Ok(AccountOutcome::Published)
    }
}
