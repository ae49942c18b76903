use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use wsn_payload::WireFormat;

#[derive(Deserialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error), used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    // Broker configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Timeout for establishing the broker connection in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Maximum unacknowledged deliveries per consumer
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    /// Fanout exchange carrying raw frames
    #[serde(default = "default_raw_exchange")]
    pub raw_exchange: String,

    /// Fanout exchange carrying decoded frames
    #[serde(default = "default_data_exchange")]
    pub data_exchange: String,

    /// Queue the cook stage consumes from the raw exchange
    #[serde(default = "default_cook_queue")]
    pub cook_queue: String,

    /// Queue the HTTP forwarder consumes from the data exchange
    #[serde(default = "default_forward_queue")]
    pub forward_queue: String,

    // Decoding
    /// `waspmote` (legacy binary frames) or `riot` (CBOR)
    #[serde(default = "default_wire_format")]
    pub wire_format: WireFormat,

    /// AES key for encrypted frames, 16, 24 or 32 bytes
    #[serde(default)]
    pub cipher_key: Option<String>,

    /// Reject encrypted frames whose inner name differs from the outer one
    #[serde(default = "default_true")]
    pub verify_encrypted_name: bool,

    /// Directory holding the device state files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Bytes kept per device while waiting for the end of a truncated frame
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    // Transport
    /// Serial device of the gateway radio; enables the raw stage
    #[serde(default)]
    pub serial_port: Option<String>,

    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,

    /// Hex address given to frames read from the serial port
    #[serde(default = "default_serial_address")]
    pub serial_address: String,

    // Stages
    #[serde(default = "default_true")]
    pub cook_enabled: bool,

    /// Endpoint of the HTTP data sink; enables the forwarder
    #[serde(default)]
    pub http_url: Option<String>,

    #[serde(default)]
    pub http_token: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// How long to stop consuming after the sink failed
    #[serde(default = "default_http_backoff_secs")]
    pub http_backoff_secs: u64,

    // Mote commands
    #[serde(default = "default_rssi_poll_interval_secs")]
    pub rssi_poll_interval_secs: u64,

    #[serde(default = "default_time_sync_interval_secs")]
    pub time_sync_interval_secs: u64,

    /// Time allowed for closers on shutdown in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_prefetch() -> u16 {
    20
}

fn default_raw_exchange() -> String {
    "wsn_raw".to_string()
}

fn default_data_exchange() -> String {
    "wsn_data".to_string()
}

fn default_cook_queue() -> String {
    "wsn_raw_cook".to_string()
}

fn default_forward_queue() -> String {
    "wsn_data_django".to_string()
}

fn default_wire_format() -> WireFormat {
    WireFormat::Waspmote
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("var")
}

fn default_max_pending_bytes() -> usize {
    wsn_domain::DEFAULT_MAX_PENDING_BYTES
}

fn default_serial_baud() -> u32 {
    9600
}

fn default_serial_address() -> String {
    "0000".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_http_backoff_secs() -> u64 {
    60
}

fn default_rssi_poll_interval_secs() -> u64 {
    55 * 60
}

fn default_time_sync_interval_secs() -> u64 {
    (6 * 60 - 5) * 60
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("WSN"))
            .build()?
            .try_deserialize()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn http_backoff(&self) -> Duration {
        Duration::from_secs(self.http_backoff_secs)
    }

    pub fn rssi_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rssi_poll_interval_secs)
    }

    pub fn time_sync_interval(&self) -> Duration {
        Duration::from_secs(self.time_sync_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// State file of one stage.
    pub fn state_file(&self, stage: &str) -> PathBuf {
        self.state_dir.join(format!("{stage}.json"))
    }
}

// Secrets stay out of the logs.
impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .field("nats_url", &self.nats_url)
            .field("prefetch", &self.prefetch)
            .field("raw_exchange", &self.raw_exchange)
            .field("data_exchange", &self.data_exchange)
            .field("wire_format", &self.wire_format)
            .field("cipher_key", &self.cipher_key.as_ref().map(|_| "<redacted>"))
            .field("state_dir", &self.state_dir)
            .field("serial_port", &self.serial_port)
            .field("cook_enabled", &self.cook_enabled)
            .field("http_url", &self.http_url)
            .field("http_token", &self.http_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "WSN_LOG_LEVEL",
        "WSN_WIRE_FORMAT",
        "WSN_PREFETCH",
        "WSN_CIPHER_KEY",
        "WSN_COOK_ENABLED",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: Test runs with mutex lock to prevent concurrent env access
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = ServiceConfig::from_env().unwrap();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.wire_format, WireFormat::Waspmote);
        assert_eq!(config.prefetch, 20);
        assert_eq!(config.raw_exchange, "wsn_raw");
        assert_eq!(config.data_exchange, "wsn_data");
        assert!(config.cipher_key.is_none());
        assert!(config.cook_enabled);
        assert_eq!(config.time_sync_interval(), Duration::from_secs(21_300));
        assert_eq!(config.rssi_poll_interval(), Duration::from_secs(3_300));
        assert_eq!(config.state_file("raw_cook"), PathBuf::from("var/raw_cook.json"));
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("WSN_LOG_LEVEL", "debug");
            std::env::set_var("WSN_WIRE_FORMAT", "riot");
            std::env::set_var("WSN_PREFETCH", "5");
            std::env::set_var("WSN_CIPHER_KEY", "0123456789abcdef");
            std::env::set_var("WSN_COOK_ENABLED", "false");
        }

        let config = ServiceConfig::from_env().unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.wire_format, WireFormat::Riot);
        assert_eq!(config.prefetch, 5);
        assert_eq!(config.cipher_key.as_deref(), Some("0123456789abcdef"));
        assert!(!config.cook_enabled);
        assert!(!format!("{config:?}").contains("0123456789abcdef"));

        clear_env();
    }
}
