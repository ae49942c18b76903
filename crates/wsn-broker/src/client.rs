use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Every bound queue gets every message.
    Fanout,
    /// A queue only gets messages whose routing key equals the queue name.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Direct => write!(f, "direct"),
        }
    }
}

/// An exchange the session uses, and the queue it consumes from it if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub queue: Option<String>,
}

impl Binding {
    pub fn consume(exchange: impl Into<String>, kind: ExchangeKind, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            queue: Some(queue.into()),
        }
    }

    pub fn publish(exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            queue: None,
        }
    }
}

/// Settles one delivery with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// With `requeue` the message is redelivered; without it is discarded.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub queue: String,
    pub routing_key: String,
    pub body: Bytes,
    pub acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("body_size", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Broker operations driven by [`BrokerTopology`](crate::BrokerTopology) actions.
/// The infrastructure implementation lives in [`crate::nats`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn open_channel(&self) -> Result<()>;

    /// Maximum number of unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, prefetch: u16) -> Result<()>;

    /// Durable exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Durable queue.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, kind: ExchangeKind) -> Result<()>;

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, queue: &str) -> Result<()>;

    /// Persistent publish; returns once the broker has stored the message.
    async fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()>;

    async fn close_channel(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
