//! Content sources: given a username, report the newest post if it is new.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::model::{ContentItem, Platform};

pub mod feed;

pub use feed::FeedSource;

/// One implementation per platform.
///
/// `check_latest` returns at most one item, and `None` when the newest item's
/// id equals `last_seen_item_id`. Fetch failures are logged by the source and
/// also yield `None`.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn platform(&self) -> Platform;

    async fn check_latest(
        &self,
        username: &str,
        last_seen_item_id: Option<&str>,
    ) -> Option<ContentItem>;
}

/// Platform-keyed lookup table, built once at startup.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<Platform, Arc<dyn ContentSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed sources for every platform with a configured feed URL.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for platform in Platform::ALL {
            if let Some(template) = cfg.feed_url(platform) {
                registry.register(Arc::new(FeedSource::new(platform, template)?));
            }
        }
        Ok(registry)
    }

    /// Register `source` under its platform, replacing any previous one.
    pub fn register(&mut self, source: Arc<dyn ContentSource>) {
        self.sources.insert(source.platform(), source);
    }

    pub fn get(&self, platform: Platform) -> Option<&Arc<dyn ContentSource>> {
        self.sources.get(&platform)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
