//! JSON-document storage. The whole document is rewritten on every mutation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::{StorageBackend, StorageKind};
use crate::model::{MonitoredAccount, NotificationGroup, Platform};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(default)]
    monitored_accounts: Vec<MonitoredAccount>,
    #[serde(default)]
    notification_groups: Vec<NotificationGroup>,
}

pub struct FileStorage {
    path: PathBuf,
    data: Mutex<Document>,
}

impl FileStorage {
    /// Open the document at `path`. Never fails: a missing, empty or
    /// unreadable document yields an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = load(&path).await;
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

async fn load(path: &Path) -> Document {
    match fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Document::default(),
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!(?err, path = %path.display(), "unreadable storage document; starting empty");
            Document::default()
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => Document::default(),
        Err(err) => {
            warn!(?err, path = %path.display(), "failed to read storage document; starting empty");
            Document::default()
        }
    }
}

fn next_id(ids: impl Iterator<Item = i64>) -> i64 {
    ids.max().unwrap_or(0) + 1
}

#[async_trait]
impl StorageBackend for FileStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::File
    }

    async fn connect(&self) -> Result<()> {
        info!(path = %self.path.display(), "file storage ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<MonitoredAccount>> {
        Ok(self.data.lock().await.monitored_accounts.clone())
    }

    #[instrument(skip_all)]
    async fn add_account(&self, username: &str, platform: Platform) -> Result<MonitoredAccount> {
        let mut data = self.data.lock().await;
        let account = MonitoredAccount {
            id: next_id(data.monitored_accounts.iter().map(|a| a.id)),
            username: username.to_string(),
            platform,
            last_seen_item_id: None,
            created_at: Utc::now(),
        };
        data.monitored_accounts.push(account.clone());
        if let Err(err) = self.save(&data).await {
            data.monitored_accounts.pop();
            return Err(err);
        }
        Ok(account)
    }

    #[instrument(skip_all)]
    async fn update_last_seen_item_id(&self, account_id: i64, item_id: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        let Some(account) = data
            .monitored_accounts
            .iter_mut()
            .find(|a| a.id == account_id)
        else {
            return Ok(());
        };
        let previous = account.last_seen_item_id.replace(item_id.to_string());
        if let Err(err) = self.save(&data).await {
            if let Some(account) = data
                .monitored_accounts
                .iter_mut()
                .find(|a| a.id == account_id)
            {
                account.last_seen_item_id = previous;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn list_groups(&self, platform: Option<Platform>) -> Result<Vec<NotificationGroup>> {
        let data = self.data.lock().await;
        Ok(data
            .notification_groups
            .iter()
            .filter(|g| platform.map_or(true, |p| g.platform == p))
            .cloned()
            .collect())
    }

    #[instrument(skip_all)]
    async fn add_group(
        &self,
        name: &str,
        platform: Platform,
        destination_id: &str,
    ) -> Result<NotificationGroup> {
        let mut data = self.data.lock().await;
        let group = NotificationGroup {
            id: next_id(data.notification_groups.iter().map(|g| g.id)),
            name: name.to_string(),
            platform,
            destination_id: destination_id.to_string(),
            created_at: Utc::now(),
        };
        data.notification_groups.push(group.clone());
        if let Err(err) = self.save(&data).await {
            data.notification_groups.pop();
            return Err(err);
        }
        Ok(group)
    }
}
