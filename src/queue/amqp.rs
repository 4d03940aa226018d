//! Durable queue on an AMQP 0-9-1 broker (RabbitMQ) through lapin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{decode, encode, MessageHandler, QueueBackend, QueueKind, QUEUE_NAME};
use crate::model::ContentItem;

const PERSISTENT: u8 = 2;

pub struct AmqpQueue {
    // Dropping the connection closes the channel.
    _connection: Connection,
    channel: Channel,
}

impl AmqpQueue {
    /// Connect, open a channel and declare the durable queue.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("failed to connect to message broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("failed to open broker channel")?;
        channel
            .queue_declare(
                QUEUE_NAME,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to declare queue")?;
        // One unacked delivery at a time keeps handling sequential.
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("failed to set prefetch")?;
        info!(queue = QUEUE_NAME, "connected to message broker");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }
}

/// What to do with a delivery once its handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

fn settle_outcome(decoded: bool, handled: bool, redelivered: bool) -> Settlement {
    match (decoded, handled) {
        (true, true) => Settlement::Ack,
        // a body that cannot be decoded will never succeed
        (false, _) => Settlement::Nack { requeue: false },
        (true, false) => Settlement::Nack {
            requeue: !redelivered,
        },
    }
}

async fn process_delivery(delivery: Delivery, handler: &dyn MessageHandler) {
    let settlement = match decode(&delivery.data) {
        Ok(item) => {
            let item_id = item.id.clone();
            match handler.handle(item).await {
                Ok(()) => settle_outcome(true, true, delivery.redelivered),
                Err(err) => {
                    error!(?err, item_id = %item_id, "error processing broker message");
                    settle_outcome(true, false, delivery.redelivered)
                }
            }
        }
        Err(err) => {
            error!(?err, "undecodable broker message");
            settle_outcome(false, false, delivery.redelivered)
        }
    };

    let result = match settlement {
        Settlement::Ack => delivery.ack(BasicAckOptions::default()).await,
        Settlement::Nack { requeue } => {
            delivery
                .nack(BasicNackOptions {
                    requeue,
                    ..Default::default()
                })
                .await
        }
    };
    if let Err(err) = result {
        warn!(?err, ?settlement, "failed to settle broker delivery");
    }
}

#[async_trait]
impl QueueBackend for AmqpQueue {
    fn kind(&self) -> QueueKind {
        QueueKind::Broker
    }

    #[instrument(skip_all, fields(item_id = %item.id))]
    async fn publish(&self, item: &ContentItem) -> Result<()> {
        let payload = encode(item)?;
        self.channel
            .basic_publish(
                "",
                QUEUE_NAME,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .context("failed to publish to broker")?
            .await
            .context("broker did not confirm publish")?;
        Ok(())
    }

    async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let tag = format!("social-relay-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                QUEUE_NAME,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to start broker consumer")?;
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => process_delivery(delivery, handler.as_ref()).await,
                    Err(err) => {
                        error!(?err, "broker consumer failed");
                        break;
                    }
                }
            }
            warn!("broker consumer stopped");
        });
        info!(queue = QUEUE_NAME, consumer_tag = %tag, "broker consumer registered");
        Ok(())
    }
}
