//! Transport of [`ContentItem`]s from the poller to the dispatcher.
//!
//! - `amqp`: durable broker queue (persistent messages, ack after handling).
//! - `memory`: in-process fan-out over tokio channels, nothing persisted.
//!
//! [`QueueFactory`] resolves one of them on first use, mirroring the storage
//! fallback policy.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::Config;
use crate::model::ContentItem;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpQueue;
pub use memory::InProcessQueue;

/// Name of the single durable queue declared on the broker.
pub const QUEUE_NAME: &str = "notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Broker,
    InProcess,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueKind::Broker => "broker",
            QueueKind::InProcess => "in-process",
        })
    }
}

/// Receives consumed items, one at a time.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, item: ContentItem) -> Result<()>;
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> QueueKind;

    async fn publish(&self, item: &ContentItem) -> Result<()>;

    /// Register `handler`; it keeps receiving items for the rest of the
    /// process lifetime.
    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;
}

pub fn encode(item: &ContentItem) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(item)?)
}

pub fn decode(payload: &[u8]) -> Result<ContentItem> {
    Ok(serde_json::from_slice(payload)?)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSettings {
    pub broker_url: Option<String>,
    pub force_in_process: bool,
}

impl QueueSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            broker_url: cfg.broker_url(),
            force_in_process: cfg.queue.in_process,
        }
    }
}

pub struct QueueFactory {
    settings: QueueSettings,
    backend: OnceCell<Arc<dyn QueueBackend>>,
}

impl QueueFactory {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            backend: OnceCell::new(),
        }
    }

    /// A factory whose backend is already chosen.
    pub fn with_backend(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            settings: QueueSettings::default(),
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    pub async fn get_queue(&self) -> Arc<dyn QueueBackend> {
        self.backend.get_or_init(|| self.resolve()).await.clone()
    }

    async fn resolve(&self) -> Arc<dyn QueueBackend> {
        if self.settings.force_in_process {
            info!("using in-process queue (forced by configuration)");
            return Arc::new(InProcessQueue::new());
        }
        match self.connect_broker().await {
            Ok(queue) => {
                info!(queue = QUEUE_NAME, "using broker queue");
                queue
            }
            Err(err) => {
                warn!(?err, "message broker unavailable; falling back to in-process queue");
                Arc::new(InProcessQueue::new())
            }
        }
    }

    async fn connect_broker(&self) -> Result<Arc<dyn QueueBackend>> {
        let url = self
            .settings
            .broker_url
            .as_deref()
            .ok_or_else(|| anyhow!("no broker url configured"))?;
        Ok(Arc::new(AmqpQueue::connect(url).await?))
    }
}
