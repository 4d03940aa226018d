//! Relational storage on SQLite through sqlx.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::OnceCell;
use tracing::{info, instrument};

use super::{StorageBackend, StorageKind};
use crate::model::{MonitoredAccount, NotificationGroup, Platform};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Relational backend. The pool is acquired by `connect` and reused by every
/// call afterwards. `disconnect` is final: the closed pool is never reopened,
/// and later `connect` or query calls fail.
pub struct SqliteStorage {
    url: String,
    pool: OnceCell<Pool>,
}

impl SqliteStorage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: OnceCell::new(),
        }
    }

    fn pool(&self) -> Result<&Pool> {
        match self.pool.get() {
            Some(pool) if pool.is_closed() => Err(anyhow!("sqlite storage was disconnected")),
            Some(pool) => Ok(pool),
            None => Err(anyhow!("sqlite storage is not connected")),
        }
    }
}

fn platform_column(row: &SqliteRow) -> Result<Platform> {
    let raw: String = row.try_get("platform")?;
    Ok(raw.parse::<Platform>()?)
}

fn account_from_row(row: &SqliteRow) -> Result<MonitoredAccount> {
    Ok(MonitoredAccount {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        platform: platform_column(row)?,
        last_seen_item_id: row.try_get("last_seen_item_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<NotificationGroup> {
    Ok(NotificationGroup {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        platform: platform_column(row)?,
        destination_id: row.try_get("destination_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Sqlite
    }

    async fn connect(&self) -> Result<()> {
        if self.pool.get().is_some_and(|pool| pool.is_closed()) {
            return Err(anyhow!("sqlite storage was disconnected"));
        }
        self.pool
            .get_or_try_init(|| async {
                let pool = init_pool(&self.url)
                    .await
                    .context("failed to open sqlite database")?;
                run_migrations(&pool)
                    .await
                    .context("failed to run migrations")?;
                Ok::<_, anyhow::Error>(pool)
            })
            .await?;
        info!("connected to sqlite storage");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("sqlite storage disconnected");
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn list_accounts(&self) -> Result<Vec<MonitoredAccount>> {
        let rows = sqlx::query(
            "SELECT id, username, platform, last_seen_item_id, created_at FROM monitored_accounts ORDER BY id",
        )
        .fetch_all(self.pool()?)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip_all)]
    async fn add_account(&self, username: &str, platform: Platform) -> Result<MonitoredAccount> {
        let row = sqlx::query(
            "INSERT INTO monitored_accounts (username, platform, created_at) VALUES (?, ?, ?) RETURNING id, username, platform, last_seen_item_id, created_at",
        )
        .bind(username)
        .bind(platform.as_str())
        .bind(Utc::now())
        .fetch_one(self.pool()?)
        .await?;
        account_from_row(&row)
    }

    #[instrument(skip_all)]
    async fn update_last_seen_item_id(&self, account_id: i64, item_id: &str) -> Result<()> {
        sqlx::query("UPDATE monitored_accounts SET last_seen_item_id = ? WHERE id = ?")
            .bind(item_id)
            .bind(account_id)
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn list_groups(&self, platform: Option<Platform>) -> Result<Vec<NotificationGroup>> {
        let pool = self.pool()?;
        let rows = match platform {
            Some(platform) => {
                sqlx::query(
                    "SELECT id, name, platform, destination_id, created_at FROM notification_groups WHERE platform = ? ORDER BY id",
                )
                .bind(platform.as_str())
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, name, platform, destination_id, created_at FROM notification_groups ORDER BY id",
                )
                .fetch_all(pool)
                .await?
            }
        };
        rows.iter().map(group_from_row).collect()
    }

    #[instrument(skip_all)]
    async fn add_group(
        &self,
        name: &str,
        platform: Platform,
        destination_id: &str,
    ) -> Result<NotificationGroup> {
        let row = sqlx::query(
            "INSERT INTO notification_groups (name, platform, destination_id, created_at) VALUES (?, ?, ?, ?) RETURNING id, name, platform, destination_id, created_at",
        )
        .bind(name)
        .bind(platform.as_str())
        .bind(destination_id)
        .bind(Utc::now())
        .fetch_one(self.pool()?)
        .await?;
        group_from_row(&row)
    }
}
