//! Serial link to the gateway radio.
//!
//! Frames arrive as a byte stream; each one starts with the `<=>` delimiter.
//! A read timeout ends the frame in progress.

use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wsn_domain::{CommandSink, DomainError, DomainResult, RawFrame};
use wsn_payload::START_DELIMITER;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Cuts a byte stream into frames at each start delimiter.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns every frame completed by a later delimiter.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        loop {
            // Search past the delimiter the current frame starts with.
            let Some(next) = self
                .buffer
                .get(1..)
                .and_then(|rest| find(rest, START_DELIMITER))
                .map(|i| i + 1)
            else {
                break;
            };
            let rest = self.buffer.split_off(next);
            let frame = std::mem::replace(&mut self.buffer, rest);
            if !frame.is_empty() {
                frames.push(frame);
            }
        }
        frames
    }

    /// Returns the frame in progress, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reader thread feeding raw frames into the raw stage.
pub struct SerialTransport {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    pub fn open(
        path: &str,
        baud: u32,
        address: Vec<u8>,
        frames: mpsc::Sender<RawFrame>,
    ) -> anyhow::Result<Self> {
        let reader = serialport::new(path, baud).timeout(READ_TIMEOUT).open()?;
        let writer = reader.try_clone()?;
        info!(path = %path, baud = baud, "Serial port opened");

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || read_loop(reader, address, frames, thread_stop))?;

        Ok(Self {
            stop,
            handle: Some(handle),
            port: Arc::new(Mutex::new(writer)),
        })
    }

    /// Outbound path sharing the open port.
    pub fn command_sink(&self) -> SerialCommandSink {
        SerialCommandSink {
            port: self.port.clone(),
        }
    }

    /// Signals the reader and returns a handle to wait for it.
    pub fn shutdown(mut self) -> Option<JoinHandle<()>> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.take()
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    address: Vec<u8>,
    frames: mpsc::Sender<RawFrame>,
    stop: Arc<AtomicBool>,
) {
    let mut splitter = FrameSplitter::new();
    let mut buf = [0u8; 256];

    let emit = |payload: Vec<u8>| {
        let frame = RawFrame::new(address.clone(), payload, chrono::Utc::now().timestamp());
        debug!(size = frame.payload.len(), "Frame read from serial port");
        frames.blocking_send(frame).is_ok()
    };

    while !stop.load(Ordering::SeqCst) {
        let chunks = match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => splitter.push(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => splitter.flush().into_iter().collect(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Serial read failed");
                break;
            }
        };

        for payload in chunks {
            if !emit(payload) {
                info!("Raw stage gone, stopping serial reader");
                return;
            }
        }
    }

    flush_remaining(&mut splitter, emit);
    info!("Serial reader stopped");
}

/// Hand the bytes still buffered in `splitter` to the raw stage. Returns whether
/// nothing was lost.
fn flush_remaining(splitter: &mut FrameSplitter, emit: impl FnOnce(Vec<u8>) -> bool) -> bool {
    let Some(payload) = splitter.flush() else {
        return true;
    };
    let size = payload.len();
    if emit(payload) {
        return true;
    }
    warn!(size, "Raw stage gone, dropping last buffered frame");
    false
}

/// Writes mote commands to the serial port.
#[derive(Clone)]
pub struct SerialCommandSink {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

#[async_trait]
impl CommandSink for SerialCommandSink {
    async fn send(&self, address: &[u8], command: &[u8]) -> DomainResult<()> {
        let port = self.port.clone();
        let command = command.to_vec();
        let size = command.len();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut port = port
                .lock()
                .map_err(|_| io::Error::other("serial port lock poisoned"))?;
            port.write_all(&command)?;
            port.flush()
        })
        .await
        .map_err(|e| DomainError::RepositoryError(anyhow::Error::new(e)))?
        .map_err(|e| {
            warn!(address = %hex::encode_upper(address), error = %e, "Serial write failed");
            DomainError::RepositoryError(anyhow::Error::new(e))
        })?;

        debug!(address = %hex::encode_upper(address), size = size, "Command written");
        Ok(())
    }
}
