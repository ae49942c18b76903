use crate::device_state::{DeviceStateStore, KEY_DATA};
use crate::error::DomainResult;
use crate::raw_frame::RawFrame;
use crate::repository::{CommandSink, RawFramePublisher};
use crate::schedule::Command;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

const PING: &[u8] = b"ping";

/// What happened to one raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOutcome {
    Published,
    Duplicate,
    Ping,
}

/// Entry stage: publishes frames from the transport to the raw exchange.
///
/// A mote retransmits until it sees an ack, so the same payload may arrive several
/// times. Only the first copy is published; every copy is acked.
pub struct RawFrameService {
    publisher: Arc<dyn RawFramePublisher>,
    commands: Arc<dyn CommandSink>,
    state: DeviceStateStore,
}

impl RawFrameService {
    pub fn new(
        publisher: Arc<dyn RawFramePublisher>,
        commands: Arc<dyn CommandSink>,
        state: DeviceStateStore,
    ) -> Self {
        Self {
            publisher,
            commands,
            state,
        }
    }

    pub fn state(&self) -> &DeviceStateStore {
        &self.state
    }

    pub async fn process_raw_frame(&mut self, raw: RawFrame, now: i64) -> DomainResult<RawOutcome> {
        let address = raw.address();
        debug!(
            address = %raw.address_hex(),
            payload_size = raw.payload.len(),
            "Processing raw frame"
        );

        if raw.payload == PING {
            info!(address = %raw.address_hex(), "Ping received");
            self.send(&raw, Command::Pong, now).await;
            return Ok(RawOutcome::Ping);
        }

        let digest = raw.payload_digest();
        if self.state.get_str(address, KEY_DATA) == Some(digest.as_str()) {
            info!(address = %raw.address_hex(), "Duplicate frame skipped");
            self.send(&raw, Command::Ack, now).await;
            return Ok(RawOutcome::Duplicate);
        }

        // Record the digest only once the frame is on the broker, so a failed publish
        // is retried when the mote resends.
        self.publisher.publish_raw(&raw).await?;
        self.state.set(address, [(KEY_DATA, json!(digest))])?;
        self.send(&raw, Command::Ack, now).await;

        Ok(RawOutcome::Published)
    }

    /// Process everything currently queued by the transport without waiting.
    ///
    /// Returns the number of frames taken from the queue, or an error from the first
    /// frame that failed. Frames after a failure stay queued.
    pub async fn drain(
        &mut self,
        queue: &mut mpsc::Receiver<RawFrame>,
        now: impl Fn() -> i64,
    ) -> DomainResult<usize> {
        let mut count = 0;
        loop {
            match queue.try_recv() {
                Ok(raw) => {
                    self.process_raw_frame(raw, now()).await?;
                    count += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if count == 0 {
                        debug!("Transport queue closed");
                    }
                    break;
                }
            }
        }
        Ok(count)
    }

    async fn send(&self, raw: &RawFrame, command: Command, now: i64) {
        if let Err(e) = self
            .commands
            .send(&raw.source_address, &command.encode(now))
            .await
        {
            warn!(
                address = %raw.address_hex(),
                command = ?command,
                error = %e,
                "Failed to send command to mote"
            );
        }
    }
}
