use crate::client::{Acker, BrokerClient, Delivery, DeliveryStream, ExchangeKind};
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{Config as StreamConfig, StorageType},
    AckKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Subject token used when a message is published without a routing key.
pub const DEFAULT_ROUTING_KEY: &str = "_";

/// Subject a message published on `exchange` with `routing_key` is stored under.
pub fn subject_for(exchange: &str, routing_key: &str) -> String {
    let routing_key = if routing_key.is_empty() {
        DEFAULT_ROUTING_KEY
    } else {
        routing_key
    };
    format!("{exchange}.{routing_key}")
}

/// Subject filter of a queue bound to `exchange`.
pub fn filter_for(exchange: &str, queue: &str, kind: ExchangeKind) -> String {
    match kind {
        ExchangeKind::Fanout => format!("{exchange}.>"),
        ExchangeKind::Direct => format!("{exchange}.{queue}"),
    }
}

struct Connection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

/// [`BrokerClient`] on NATS JetStream.
///
/// An exchange is a file-backed stream holding the subjects `<exchange>.>`, a queue
/// is a durable pull consumer named after it, and a binding is the consumer's
/// subject filter.
pub struct NatsBroker {
    url: String,
    timeout: Duration,
    connection: OnceLock<Connection>,
    prefetch: AtomicU16,
    consumers: Mutex<HashMap<String, PullConsumer>>,
}

impl NatsBroker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            connection: OnceLock::new(),
            prefetch: AtomicU16::new(0),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .get()
            .ok_or_else(|| anyhow!("NATS connection is not open"))
    }

    fn jetstream(&self) -> Result<jetstream::Context> {
        Ok(self.connection()?.jetstream.clone())
    }

    fn consumer(&self, queue: &str) -> Result<PullConsumer> {
        self.consumers
            .lock()
            .map_err(|_| anyhow!("consumer registry poisoned"))?
            .get(queue)
            .cloned()
            .ok_or_else(|| anyhow!("queue '{queue}' is not bound"))
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    async fn connect(&self) -> Result<()> {
        info!(url = %self.url, timeout_ms = self.timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(self.timeout)
            .connect(self.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());
        if self.connection.set(Connection { client, jetstream }).is_err() {
            return Err(anyhow!("NATS connection already open"));
        }

        info!("Successfully connected to NATS");
        Ok(())
    }

    async fn open_channel(&self) -> Result<()> {
        // JetStream has no channels; check the account has JetStream enabled instead.
        self.jetstream()?
            .query_account()
            .await
            .context("JetStream is not available")?;
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        self.prefetch.store(prefetch, Ordering::Relaxed);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let jetstream = self.jetstream()?;
        info!(stream = %name, kind = %kind, "Ensuring stream exists");

        match jetstream.get_stream(name).await {
            Ok(_) => {
                info!(stream = %name, "Stream already exists");
            }
            Err(_) => {
                jetstream
                    .create_stream(StreamConfig {
                        name: name.to_string(),
                        subjects: vec![format!("{name}.>")],
                        description: Some(format!("{kind} exchange {name}")),
                        storage: StorageType::File,
                        ..Default::default()
                    })
                    .await
                    .context("Failed to create stream")?;
                info!(stream = %name, "Created stream");
            }
        }

        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        // The durable consumer is created when the queue is bound.
        debug!(queue = %name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, kind: ExchangeKind) -> Result<()> {
        let filter_subject = filter_for(exchange, queue, kind);
        let prefetch = self.prefetch.load(Ordering::Relaxed);
        debug!(
            stream = %exchange,
            consumer = %queue,
            subject = %filter_subject,
            prefetch,
            "Creating JetStream consumer"
        );

        let config = pull::Config {
            name: Some(queue.to_string()),
            durable_name: Some(queue.to_string()),
            filter_subject,
            ack_policy: AckPolicy::Explicit,
            max_ack_pending: if prefetch == 0 { -1 } else { i64::from(prefetch) },
            ..Default::default()
        };
        let consumer = self
            .jetstream()?
            .create_consumer_on_stream(config, exchange)
            .await
            .context("Failed to create consumer")?;

        self.consumers
            .lock()
            .map_err(|_| anyhow!("consumer registry poisoned"))?
            .insert(queue.to_string(), consumer);

        info!(stream = %exchange, consumer = %queue, "Consumer created successfully");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        let messages = self
            .consumer(queue)?
            .messages()
            .await
            .context("Failed to start consuming")?;

        let queue = queue.to_string();
        let watched = queue.clone();
        let stream = messages
            .take_while(move |result| {
                let deleted = matches!(
                    result,
                    Err(e) if e.kind() == pull::MessagesErrorKind::ConsumerDeleted
                );
                if deleted {
                    warn!(queue = %watched, "Consumer deleted, ending subscription");
                }
                futures::future::ready(!deleted)
            })
            .filter_map(move |result| {
                let delivery = match result {
                    Ok(message) => Some(NatsDelivery::into_delivery(&queue, message)),
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Error receiving message");
                        None
                    }
                };
                futures::future::ready(delivery)
            });

        Ok(stream.boxed())
    }

    async fn cancel(&self, queue: &str) -> Result<()> {
        // Dropping the message stream stops the pull requests; unacked messages are
        // redelivered once their ack wait expires.
        debug!(queue = %queue, "Subscription cancelled");
        Ok(())
    }

    #[instrument(skip(self, body), fields(payload_size = body.len()))]
    async fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()> {
        let subject = subject_for(exchange, routing_key);

        let ack = self
            .jetstream()?
            .publish(subject, body)
            .await
            .context("Failed to publish message to JetStream")?;

        ack.await
            .context("Failed to receive JetStream acknowledgment")?;
        Ok(())
    }

    async fn close_channel(&self) -> Result<()> {
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.clear();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing NATS connection");
        if let Some(connection) = self.connection.get() {
            connection
                .client
                .flush()
                .await
                .context("Failed to flush NATS connection")?;
        }
        Ok(())
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

impl NatsDelivery {
    fn into_delivery(queue: &str, message: jetstream::Message) -> Delivery {
        let routing_key = message
            .subject
            .as_str()
            .split_once('.')
            .map(|(_, key)| key.to_string())
            .unwrap_or_default();
        Delivery {
            queue: queue.to_string(),
            routing_key,
            body: message.payload.clone(),
            acker: Box::new(NatsDelivery { message }),
        }
    }
}

#[async_trait]
impl Acker for NatsDelivery {
    async fn ack(&self) -> Result<()> {
        self.message.ack().await.map_err(|e| anyhow!(e))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.message.ack_with(kind).await.map_err(|e| anyhow!(e))
    }
}
