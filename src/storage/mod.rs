//! Account and group persistence.
//!
//! Two backends share the [`StorageBackend`] contract:
//! - `sqlite`: relational storage through sqlx, used when a database URL is configured.
//! - `file`: a single JSON document, used as the fallback.
//!
//! [`StorageFactory`] picks one of them on first use and keeps it for the
//! lifetime of the process.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::Config;
use crate::model::{MonitoredAccount, NotificationGroup, Platform};

pub mod file;
pub mod sqlite;

pub use file::FileStorage;
pub use sqlite::SqliteStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Sqlite,
    File,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Sqlite => "sqlite",
            StorageKind::File => "file",
        })
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn list_accounts(&self) -> Result<Vec<MonitoredAccount>>;

    async fn add_account(&self, username: &str, platform: Platform) -> Result<MonitoredAccount>;

    /// Record the newest item seen for an account. Unknown ids are ignored.
    async fn update_last_seen_item_id(&self, account_id: i64, item_id: &str) -> Result<()>;

    /// Groups for `platform`, or every group when `None`.
    async fn list_groups(&self, platform: Option<Platform>) -> Result<Vec<NotificationGroup>>;

    async fn add_group(
        &self,
        name: &str,
        platform: Platform,
        destination_id: &str,
    ) -> Result<NotificationGroup>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub database_url: Option<String>,
    pub file_path: PathBuf,
}

impl StorageSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            database_url: cfg.database_url(),
            file_path: cfg.file_path(),
        }
    }
}

/// Resolves the storage backend once and hands out the same instance after.
///
/// The relational backend is tried only when a database URL is set; any
/// failure while connecting or during the verification read commits the
/// process to file storage. The primary is never retried.
pub struct StorageFactory {
    settings: StorageSettings,
    backend: OnceCell<Arc<dyn StorageBackend>>,
}

impl StorageFactory {
    pub fn new(settings: StorageSettings) -> Self {
        Self {
            settings,
            backend: OnceCell::new(),
        }
    }

    /// A factory whose backend is already chosen.
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            settings: StorageSettings {
                database_url: None,
                file_path: PathBuf::new(),
            },
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    /// Concurrent callers during the first resolution wait for its result.
    pub async fn get_storage(&self) -> Arc<dyn StorageBackend> {
        self.backend
            .get_or_init(|| self.resolve())
            .await
            .clone()
    }

    async fn resolve(&self) -> Arc<dyn StorageBackend> {
        match self.connect_primary().await {
            Ok(primary) => {
                info!("using sqlite storage");
                primary
            }
            Err(err) => {
                warn!(
                    ?err,
                    path = %self.settings.file_path.display(),
                    "relational storage unavailable; falling back to file storage"
                );
                let file = FileStorage::open(&self.settings.file_path).await;
                if let Err(err) = file.connect().await {
                    warn!(?err, "file storage connect reported an error");
                }
                Arc::new(file)
            }
        }
    }

    async fn connect_primary(&self) -> Result<Arc<dyn StorageBackend>> {
        let url = self
            .settings
            .database_url
            .as_deref()
            .ok_or_else(|| anyhow!("no database url configured"))?;
        info!("attempting to connect to sqlite storage");
        let storage = SqliteStorage::new(url);
        storage.connect().await?;
        storage
            .list_accounts()
            .await
            .context("verification read failed")?;
        Ok(Arc::new(storage))
    }
}
