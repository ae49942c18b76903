use crate::client::Delivery;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum HandlerError {
    /// The message could not be handled now; requeue it and stop consuming for a while.
    #[error("Consumer paused for {0:?}")]
    Pause(Duration),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Business logic behind a consumed queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, body: serde_json::Value) -> Result<(), HandlerError>;
}

/// Work run periodically on the session loop, e.g. draining a transport queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackgroundTask: Send {
    async fn run(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    /// Requeued; the caller must pause the topology for the given time.
    Pause(Duration),
    /// Logged and left unsettled.
    Failed,
    /// Arrived while paused; left unsettled.
    Dropped,
}

/// Runs one delivery through the handler and settles it with the broker.
pub struct ConsumerSupervisor {
    handler: Box<dyn MessageHandler>,
}

impl ConsumerSupervisor {
    pub fn new(handler: Box<dyn MessageHandler>) -> Self {
        Self { handler }
    }

    pub async fn on_delivery(&mut self, delivery: Delivery, paused: bool) -> Outcome {
        if paused {
            debug!(queue = %delivery.queue, "Delivery while paused, dropping");
            return Outcome::Dropped;
        }

        let body: serde_json::Value = match serde_json::from_slice(&delivery.body) {
            Ok(body) => body,
            Err(e) => {
                error!(
                    queue = %delivery.queue,
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Message body is not valid JSON"
                );
                return Outcome::Failed;
            }
        };

        match self.handler.handle(body).await {
            Ok(()) => {
                if let Err(e) = delivery.acker.ack().await {
                    error!(queue = %delivery.queue, error = %e, "Failed to acknowledge message");
                }
                debug!(queue = %delivery.queue, "Message received and handled");
                Outcome::Acked
            }
            Err(HandlerError::Pause(duration)) => {
                warn!(
                    queue = %delivery.queue,
                    pause_secs = duration.as_secs_f64(),
                    "Handler asked to pause, requeueing message"
                );
                if let Err(e) = delivery.acker.nack(true).await {
                    error!(queue = %delivery.queue, error = %e, "Failed to requeue message");
                }
                Outcome::Pause(duration)
            }
            Err(HandlerError::Failed(e)) => {
                error!(
                    queue = %delivery.queue,
                    routing_key = %delivery.routing_key,
                    error = ?e,
                    "Message handling failed"
                );
                Outcome::Failed
            }
        }
    }
}
