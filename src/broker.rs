//! Broker Adapter. Declares the durable queue topology (work queues plus a
//! per-queue dead-letter queue behind one direct exchange), publishes
//! persistent JSON envelopes, and hands out prefetch-1 consumers.
//!
//! Delivery is at-least-once to the database transition and exactly-once to
//! the ack: a worker crash after mutation but before ack causes redelivery,
//! which the worker runtime absorbs through its idempotency gate.

use anyhow::{Context, Result};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{JobEnvelope, WorkQueue};

const DEAD_LETTER_EXCHANGE: &str = "conveyor.dlx";

/// A channel paired with the connection that owns it; the connection handle
/// must outlive the channel.
struct Link {
    connection: Connection,
    channel: Channel,
}

/// A live consumer plus the connection and channel it rides on. Dropping the
/// handle tears all three down together.
pub struct ConsumerHandle {
    _connection: Connection,
    _channel: Channel,
    pub consumer: Consumer,
}

pub struct Broker {
    uri: String,
    publisher: Mutex<Option<Link>>,
}

impl Broker {
    /// Connect and declare the full topology.
    pub async fn connect(uri: &str) -> Result<Self> {
        let broker = Broker {
            uri: uri.to_string(),
            publisher: Mutex::new(None),
        };
        let link = broker.open_link().await?;
        *broker.publisher.lock().await = Some(link);
        Ok(broker)
    }

    async fn open_link(&self) -> Result<Link> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .context("connecting to broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("opening broker channel")?;
        declare_topology(&channel).await?;
        Ok(Link {
            connection,
            channel,
        })
    }

    /// Publish one job envelope as a persistent JSON message. On a stale
    /// channel the adapter reconnects once before giving up.
    pub async fn publish(&self, queue: WorkQueue, envelope: &JobEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope).context("encoding job envelope")?;
        let mut guard = self.publisher.lock().await;

        let usable = guard
            .as_ref()
            .is_some_and(|link| link.channel.status().connected());
        if !usable {
            if guard.is_some() {
                warn!("broker channel lost, reconnecting");
            }
            *guard = Some(self.open_link().await?);
        }
        let channel = &guard.as_ref().expect("link just ensured").channel;

        match basic_publish(channel, queue, &payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = format!("{err:#}"), "publish failed, reconnecting");
                let link = self.open_link().await?;
                basic_publish(&link.channel, queue, &payload).await?;
                *guard = Some(link);
                Ok(())
            }
        }
    }

    /// Open a fresh prefetch-1 consumer on a queue. Acks go through the
    /// delivery handles themselves.
    pub async fn consumer(&self, queue: WorkQueue, tag: &str) -> Result<ConsumerHandle> {
        let link = self.open_link().await?;
        link.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .context("setting prefetch")?;
        let consumer = link
            .channel
            .basic_consume(
                queue.name(),
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("consuming from {}", queue.name()))?;
        info!(queue = queue.name(), tag, "consumer started");
        Ok(ConsumerHandle {
            _connection: link.connection,
            _channel: link.channel,
            consumer,
        })
    }
}

async fn basic_publish(channel: &Channel, queue: WorkQueue, payload: &[u8]) -> Result<()> {
    channel
        .basic_publish(
            "",
            queue.name(),
            BasicPublishOptions::default(),
            payload,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_content_type("application/json".into()),
        )
        .await
        .with_context(|| format!("publishing to {}", queue.name()))?
        .await
        .context("broker publish confirmation")?;
    Ok(())
}

/// Declare every queue durable, each wired to its dead-letter twin. Safe to
/// repeat: declarations are idempotent as long as arguments match.
async fn declare_topology(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .context("declaring dead-letter exchange")?;

    let durable = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };

    for queue in WorkQueue::ALL {
        let dead_name = queue.dead_letter_name();
        channel
            .queue_declare(&dead_name, durable, FieldTable::default())
            .await
            .with_context(|| format!("declaring {dead_name}"))?;
        channel
            .queue_bind(
                &dead_name,
                DEAD_LETTER_EXCHANGE,
                queue.name(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("binding {dead_name}"))?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(queue.name().into()),
        );
        channel
            .queue_declare(queue.name(), durable, args)
            .await
            .with_context(|| format!("declaring {}", queue.name()))?;
    }
    Ok(())
}
