//! Async RabbitMQ publisher for outbound envelopes.
//!
//! Calls issued by the producer and replies emitted by the dispatcher both
//! leave the process through [`Transport::publish`].

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::Envelope;

/// Outbound path for envelopes.
pub trait Transport: Send + Sync + 'static {
    /// Publish `envelope` to the queue named `queue` on the default exchange.
    fn publish(&self, queue: &str, envelope: &Envelope) -> impl Future<Output = Result<()>> + Send;
}

/// Async RabbitMQ publisher with connection management.
///
/// The publisher maintains a persistent connection and channel to RabbitMQ,
/// reconnecting lazily when the channel is found closed.
#[derive(Clone)]
pub struct AmqpPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    declare: Vec<String>,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpPublisher {
    /// Create a publisher. `declare` lists queues declared (durable) on every
    /// fresh connection; reply queues named by callers are never declared.
    pub fn new(url: String, declare: Vec<String>) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                declare,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        for queue in &self.inner.declare {
            ch.queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {queue}"))?;
        }

        info!(queues = ?self.inner.declare, "rabbitmq_publisher_connected");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

/// Broker properties for an envelope: persistent, JSON, correlated by id.
pub(crate) fn properties_for(envelope: &Envelope) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_message_id(envelope.id.clone().into())
        .with_correlation_id(envelope.id.clone().into())
        .with_type(envelope.message_type.clone().into());

    if envelope.reply_to.is_empty() {
        properties
    } else {
        properties.with_reply_to(envelope.reply_to.clone().into())
    }
}

impl Transport for AmqpPublisher {
    async fn publish(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(envelope).context("Failed to serialize envelope")?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                properties_for(envelope),
            )
            .await
            .with_context(|| format!("Failed to publish to {queue}"))?
            .await
            .context("Failed to confirm publish")?;

        debug!(
            queue = queue,
            id = %envelope.id,
            message_type = %envelope.message_type,
            body_length = body.len(),
            "rabbitmq_envelope_published"
        );

        Ok(())
    }
}
