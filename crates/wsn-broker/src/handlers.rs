use crate::supervisor::{BackgroundTask, HandlerError, MessageHandler};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use wsn_domain::{CookService, DataForwarder, DomainError, RawFrame, RawFrameService};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn failed(e: DomainError) -> HandlerError {
    HandlerError::Failed(e.into())
}

/// Consumes the raw queue with a [`CookService`].
pub struct CookHandler {
    service: CookService,
}

impl CookHandler {
    pub fn new(service: CookService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for CookHandler {
    async fn handle(&mut self, body: serde_json::Value) -> Result<(), HandlerError> {
        let published = self.service.process_body(body, now()).await.map_err(failed)?;
        debug!(published, "Raw frame cooked");
        Ok(())
    }
}

/// Consumes the data queue with a [`DataForwarder`], backing off while the sink is down.
pub struct ForwardHandler {
    forwarder: DataForwarder,
    backoff: Duration,
}

impl ForwardHandler {
    pub fn new(forwarder: DataForwarder, backoff: Duration) -> Self {
        Self { forwarder, backoff }
    }
}

#[async_trait]
impl MessageHandler for ForwardHandler {
    async fn handle(&mut self, body: serde_json::Value) -> Result<(), HandlerError> {
        match self.forwarder.forward(&body).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Data sink unavailable");
                Err(HandlerError::Pause(self.backoff))
            }
            Err(e) => Err(failed(e)),
        }
    }
}

/// Publishes the frames queued by the transport thread.
pub struct RawDrainTask {
    service: RawFrameService,
    queue: mpsc::Receiver<RawFrame>,
}

impl RawDrainTask {
    pub fn new(service: RawFrameService, queue: mpsc::Receiver<RawFrame>) -> Self {
        Self { service, queue }
    }
}

#[async_trait]
impl BackgroundTask for RawDrainTask {
    async fn run(&mut self) -> anyhow::Result<()> {
        let count = self.service.drain(&mut self.queue, now).await?;
        if count > 0 {
            debug!(count, "Raw frames drained");
        }
        Ok(())
    }
}
