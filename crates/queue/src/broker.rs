//! AMQP binding: topology declaration, a manual-ack consumer, and the
//! channel that hands deliveries to the pipeline.

use crate::error::Disposition;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("could not connect to broker: {0}")]
    Connect(#[source] lapin::Error),
    #[error("could not declare {what}: {source}")]
    Topology {
        what: String,
        #[source]
        source: lapin::Error,
    },
    #[error("could not start consumer: {0}")]
    Consume(#[source] lapin::Error),
    #[error("could not publish: {0}")]
    Publish(#[source] lapin::Error),
    #[error("acknowledgement failed: {0}")]
    Ack(#[source] lapin::Error),
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
    pub prefetch_count: u16,
    /// Redeliveries before the broker dead-letters a message; needs a quorum queue.
    pub delivery_limit: Option<u32>,
    pub consumer_tag: String,
    pub channel_capacity: usize,
}

impl BrokerSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: "invoices_exchange".into(),
            queue: "invoices".into(),
            routing_key: "invoice.create".into(),
            dead_letter_exchange: "dead_letter_exchange".into(),
            dead_letter_queue: "dead_letter_queue".into(),
            dead_letter_routing_key: "dead_letter".into(),
            prefetch_count: 200,
            delivery_limit: None,
            consumer_tag: "payrouter".into(),
            channel_capacity: 200,
        }
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(self.dead_letter_exchange.clone().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(self.dead_letter_routing_key.clone().into()),
        );
        if let Some(limit) = self.delivery_limit {
            args.insert(
                "x-queue-type".into(),
                AMQPValue::LongString("quorum".into()),
            );
            args.insert(
                "x-delivery-limit".into(),
                AMQPValue::LongLongInt(i64::from(limit)),
            );
        }
        args
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

struct LapinAcknowledger(Acker);

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(BrokerError::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(BrokerError::Ack)
    }
}

pub struct InboundMessage {
    pub body: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(body: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self { body, acker }
    }

    pub async fn settle(&self, disposition: Disposition) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => self.acker.ack().await,
            Disposition::Drop => self.acker.nack(false).await,
            Disposition::Requeue => self.acker.nack(true).await,
        }
    }
}

/// Live broker session with the topology declared.
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    settings: BrokerSettings,
    forwarder: Option<JoinHandle<()>>,
}

/// Connects, sets the prefetch window and declares the topology.
pub async fn connect(settings: BrokerSettings) -> Result<BrokerConnection, BrokerError> {
    let connection = Connection::connect(
        &settings.url,
        ConnectionProperties::default().with_connection_name(settings.consumer_tag.clone().into()),
    )
    .await
    .map_err(BrokerError::Connect)?;

    let channel = connection
        .create_channel()
        .await
        .map_err(BrokerError::Connect)?;
    channel
        .basic_qos(settings.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(BrokerError::Connect)?;

    declare_topology(&channel, &settings).await?;
    tracing::info!(
        exchange = %settings.exchange,
        queue = %settings.queue,
        routing_key = %settings.routing_key,
        dead_letter_queue = %settings.dead_letter_queue,
        "broker topology ready"
    );

    Ok(BrokerConnection {
        connection,
        channel,
        settings,
        forwarder: None,
    })
}

async fn declare_topology(channel: &Channel, settings: &BrokerSettings) -> Result<(), BrokerError> {
    let topology = |what: &str| {
        let what = what.to_string();
        move |source| BrokerError::Topology { what, source }
    };
    let durable_exchange = || ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    let durable_queue = || QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            &settings.exchange,
            ExchangeKind::Direct,
            durable_exchange(),
            FieldTable::default(),
        )
        .await
        .map_err(topology(settings.exchange.as_str()))?;
    channel
        .exchange_declare(
            &settings.dead_letter_exchange,
            ExchangeKind::Direct,
            durable_exchange(),
            FieldTable::default(),
        )
        .await
        .map_err(topology(settings.dead_letter_exchange.as_str()))?;
    channel
        .queue_declare(&settings.queue, durable_queue(), settings.queue_arguments())
        .await
        .map_err(topology(settings.queue.as_str()))?;
    channel
        .queue_declare(
            &settings.dead_letter_queue,
            durable_queue(),
            FieldTable::default(),
        )
        .await
        .map_err(topology(settings.dead_letter_queue.as_str()))?;
    channel
        .queue_bind(
            &settings.dead_letter_queue,
            &settings.dead_letter_exchange,
            &settings.dead_letter_routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(topology("dead letter binding"))?;
    channel
        .queue_bind(
            &settings.queue,
            &settings.exchange,
            &settings.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(topology("queue binding"))?;
    Ok(())
}

async fn forward(mut consumer: Consumer, tx: mpsc::Sender<InboundMessage>) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => {
                tracing::debug!(
                    delivery_tag = delivery.delivery_tag,
                    redelivered = delivery.redelivered,
                    "delivery received"
                );
                let message =
                    InboundMessage::new(delivery.data, Box::new(LapinAcknowledger(delivery.acker)));
                if tx.send(message).await.is_err() {
                    tracing::info!("pipeline inbox closed, stopping consumer");
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "consumer stream failed");
                break;
            }
        }
    }
}

impl BrokerConnection {
    /// Starts a manual-ack consumer forwarding deliveries into a bounded channel.
    pub async fn consume(&mut self) -> Result<mpsc::Receiver<InboundMessage>, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.settings.queue,
                &self.settings.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Consume)?;

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        if let Some(previous) = self.forwarder.replace(tokio::spawn(forward(consumer, tx))) {
            previous.abort();
        }
        tracing::info!(queue = %self.settings.queue, "consuming");
        Ok(rx)
    }

    /// Publishes a persistent task onto the invoice exchange.
    pub async fn publish(&self, body: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                &self.settings.exchange,
                &self.settings.routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(BrokerError::Publish)?
            .await
            .map_err(BrokerError::Publish)?;
        Ok(())
    }

    pub async fn close(self) {
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        if let Err(e) = self.connection.close(200, "shutdown").await {
            tracing::warn!(error = %e, "broker connection did not close cleanly");
        }
    }
}
