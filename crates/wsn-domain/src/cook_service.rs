use crate::device_state::{DeviceStateStore, KEY_NAME, KEY_SERIAL};
use crate::error::DomainResult;
use crate::raw_frame::{RawFrame, RawFrameBody};
use crate::repository::{CommandSink, FramePublisher};
use crate::schedule::Schedule;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use wsn_payload::{DecodedFrame, FrameCodec, FRAME_TYPE_EVENT};

/// Bytes kept per address while waiting for the rest of a truncated frame.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 1024;

/// Turns raw frames into decoded frames on the data exchange.
///
/// Flow per raw frame:
/// 1. Prepend bytes left over from a truncated frame of the same address
/// 2. Decode every frame in the payload
/// 3. Backfill the device name, stamp, publish
/// 4. Remember serial/name and fire due commands
pub struct CookService {
    codec: FrameCodec,
    publisher: Arc<dyn FramePublisher>,
    commands: Option<Arc<dyn CommandSink>>,
    state: DeviceStateStore,
    schedules: Vec<Schedule>,
    pending: HashMap<u64, Vec<u8>>,
    max_pending_bytes: usize,
}

impl CookService {
    pub fn new(
        codec: FrameCodec,
        publisher: Arc<dyn FramePublisher>,
        state: DeviceStateStore,
    ) -> Self {
        Self {
            codec,
            publisher,
            commands: None,
            state,
            schedules: Vec::new(),
            pending: HashMap::new(),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }

    /// Send scheduled commands through `commands` after each decoded frame.
    pub fn with_commands(mut self, commands: Arc<dyn CommandSink>, schedules: Vec<Schedule>) -> Self {
        self.commands = Some(commands);
        self.schedules = schedules;
        self
    }

    pub fn with_max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max;
        self
    }

    pub fn state(&self) -> &DeviceStateStore {
        &self.state
    }

    /// Entry point for bodies consumed from the raw exchange.
    pub async fn process_body(&mut self, body: serde_json::Value, now: i64) -> DomainResult<usize> {
        let body = RawFrameBody::from_json(body)?;
        if !body.is_rx() {
            warn!(id = %body.id, "Unexpected raw frame id, ignoring");
            return Ok(0);
        }
        let raw = body.into_frame()?;
        self.process_raw_frame(raw, now).await
    }

    /// Decode and publish all frames in `raw`. Returns the number of frames published.
    ///
    /// Decode failures are logged and swallowed; only publish and state storage
    /// errors are returned.
    pub async fn process_raw_frame(&mut self, raw: RawFrame, now: i64) -> DomainResult<usize> {
        let address = raw.address();

        let data = match self.pending.remove(&address) {
            Some(mut buffered) => {
                debug!(
                    address = %raw.address_hex(),
                    buffered = buffered.len(),
                    "Retrying truncated frame with new bytes"
                );
                buffered.extend_from_slice(&raw.payload);
                buffered
            }
            None => raw.payload.clone(),
        };

        let mut published = 0;
        let mut rest: &[u8] = &data;

        while self.codec.has_frame(rest) {
            match self.codec.decode(rest) {
                Ok((frame, remaining)) => {
                    rest = remaining;
                    self.handle_frame(frame, &raw, now).await?;
                    published += 1;
                }
                Err(e) if e.is_retryable() => {
                    if rest.len() > self.max_pending_bytes {
                        warn!(
                            address = %raw.address_hex(),
                            buffered = rest.len(),
                            "Truncated frame buffer too large, dropping"
                        );
                    } else {
                        debug!(
                            address = %raw.address_hex(),
                            error = %e,
                            "Frame incomplete, waiting for more bytes"
                        );
                        self.pending.insert(address, rest.to_vec());
                    }
                    break;
                }
                Err(e) => {
                    warn!(
                        address = %raw.address_hex(),
                        format = %self.codec.format(),
                        error = %e,
                        "Failed to decode frame, dropping"
                    );
                    match self.codec.skip_frame(rest) {
                        Some(remaining) => rest = remaining,
                        None => break,
                    }
                }
            }
        }

        Ok(published)
    }

    async fn handle_frame(&mut self, mut frame: DecodedFrame, raw: &RawFrame, now: i64) -> DomainResult<()> {
        let address = raw.address();

        // Boot frames never carry a name and must not get a stale one.
        if !frame.has_name() && frame.frame_type != FRAME_TYPE_EVENT {
            if let Some(name) = self.state.get_str(address, KEY_NAME) {
                frame.name = Some(name.to_string());
            }
        }

        frame.stamp(raw.received_at, address);
        self.publisher.publish_frame(&frame).await?;

        info!(
            address = %raw.address_hex(),
            serial = frame.serial,
            name = frame.name.as_deref().unwrap_or_default(),
            fields = frame.fields.len(),
            "Published decoded frame"
        );

        self.state.set(
            address,
            [
                (KEY_SERIAL, json!(frame.serial)),
                (KEY_NAME, json!(frame.name.as_deref().unwrap_or_default())),
            ],
        )?;

        self.run_schedules(raw, now).await
    }

    async fn run_schedules(&mut self, raw: &RawFrame, now: i64) -> DomainResult<()> {
        let Some(commands) = self.commands.clone() else {
            return Ok(());
        };
        let address = raw.address();

        for schedule in self.schedules.clone() {
            let last = self.state.get_i64(address, schedule.state_key);
            if !schedule.is_due(last, now) {
                continue;
            }

            let command = schedule.command.encode(now);
            match commands.send(&raw.source_address, &command).await {
                Ok(()) => {
                    info!(
                        address = %raw.address_hex(),
                        command = %String::from_utf8_lossy(&command),
                        "Sent scheduled command"
                    );
                    self.state.set(address, [(schedule.state_key, json!(now))])?;
                }
                Err(e) => {
                    error!(
                        address = %raw.address_hex(),
                        error = %e,
                        "Failed to send scheduled command"
                    );
                }
            }
        }

        Ok(())
    }
}
