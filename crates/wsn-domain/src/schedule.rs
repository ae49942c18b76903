use crate::device_state::{KEY_CMD_TIME, KEY_RSSI_TST};
use std::time::Duration;

/// Commands understood by the mote firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Acknowledge a received frame.
    Ack,
    /// Answer to a `ping` frame.
    Pong,
    /// Ask the mote to report its signal strength.
    RssiPoll,
    /// Set the mote clock.
    TimeSync,
}

impl Command {
    pub fn encode(&self, now: i64) -> Vec<u8> {
        match self {
            Command::Ack => b"ack".to_vec(),
            Command::Pong => format!("pong {now}").into_bytes(),
            Command::RssiPoll => b"rssi".to_vec(),
            Command::TimeSync => format!("time {now}").into_bytes(),
        }
    }
}

/// A command sent to each device at most once per `interval`.
///
/// The time of the last send is kept in the device record under `state_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub command: Command,
    pub state_key: &'static str,
    pub interval: Duration,
}

impl Schedule {
    pub fn rssi_poll(interval: Duration) -> Self {
        Self {
            command: Command::RssiPoll,
            state_key: KEY_RSSI_TST,
            interval,
        }
    }

    pub fn time_sync(interval: Duration) -> Self {
        Self {
            command: Command::TimeSync,
            state_key: KEY_CMD_TIME,
            interval,
        }
    }

    /// Strictly more than `interval` seconds since `last` (never sent counts as 0).
    pub fn is_due(&self, last: Option<i64>, now: i64) -> bool {
        let interval = i64::try_from(self.interval.as_secs()).unwrap_or(i64::MAX);
        now.saturating_sub(last.unwrap_or(0)) > interval
    }
}
