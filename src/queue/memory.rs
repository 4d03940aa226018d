use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use super::{MessageHandler, QueueBackend, QueueKind};
use crate::model::ContentItem;

/// In-process queue. Every registered handler gets its own channel and task;
/// `publish` fans the item out to all of them. Items published while no
/// handler is registered are dropped.
#[derive(Default)]
pub struct InProcessQueue {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ContentItem>>>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for InProcessQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::InProcess
    }

    async fn publish(&self, item: &ContentItem) -> Result<()> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        if subscribers.is_empty() {
            debug!(item_id = %item.id, "no in-process consumer registered; item dropped");
        }
        Ok(())
    }

    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ContentItem>();
        self.subscribers.lock().await.push(tx);
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let item_id = item.id.clone();
                if let Err(err) = handler.handle(item).await {
                    error!(?err, item_id = %item_id, "error processing in-process message");
                }
            }
        });
        info!("in-process consumer registered");
        Ok(())
    }
}
