use crate::error::{DomainError, DomainResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Body id of a frame received from a mote.
pub const RX_FRAME_ID: &str = "rx";

/// Bytes received from one mote, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Transport address, 2 or 8 bytes big-endian.
    pub source_address: Vec<u8>,
    /// Raw bytes including framing delimiters.
    pub payload: Vec<u8>,
    /// Unix seconds.
    pub received_at: i64,
    pub transport_options: Option<Vec<u8>>,
}

impl RawFrame {
    pub fn new(source_address: Vec<u8>, payload: Vec<u8>, received_at: i64) -> Self {
        Self {
            source_address,
            payload,
            received_at,
            transport_options: None,
        }
    }

    pub fn with_options(mut self, options: Vec<u8>) -> Self {
        self.transport_options = Some(options);
        self
    }

    /// The source address as an integer. Device state is keyed by this.
    pub fn address(&self) -> u64 {
        self.source_address
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn address_hex(&self) -> String {
        hex::encode_upper(&self.source_address)
    }

    /// Digest stored per device to detect retransmissions of the same payload.
    pub fn payload_digest(&self) -> String {
        BASE64.encode(&self.payload)
    }

    pub fn to_body(&self) -> RawFrameBody {
        RawFrameBody {
            id: RX_FRAME_ID.to_string(),
            source_addr: self.address_hex(),
            data: self.payload_digest(),
            received: self.received_at,
            options: self.transport_options.as_ref().map(|o| BASE64.encode(o)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_body()).unwrap_or(serde_json::Value::Null)
    }
}

/// JSON body of a raw frame on the raw exchange. Binary fields are base64,
/// the address is upper-case hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrameBody {
    pub id: String,
    pub source_addr: String,
    pub data: String,
    pub received: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

impl RawFrameBody {
    pub fn from_json(value: serde_json::Value) -> DomainResult<Self> {
        serde_json::from_value(value).map_err(|e| DomainError::InvalidRawFrame(e.to_string()))
    }

    pub fn is_rx(&self) -> bool {
        self.id == RX_FRAME_ID
    }

    pub fn into_frame(self) -> DomainResult<RawFrame> {
        let source_address = hex::decode(&self.source_addr).map_err(|e| {
            DomainError::InvalidRawFrame(format!("source_addr '{}': {}", self.source_addr, e))
        })?;
        if source_address.is_empty() || source_address.len() > 8 {
            return Err(DomainError::InvalidRawFrame(format!(
                "source_addr must be 1 to 8 bytes, got {}",
                source_address.len()
            )));
        }

        let payload = BASE64
            .decode(&self.data)
            .map_err(|e| DomainError::InvalidRawFrame(format!("data: {e}")))?;

        let transport_options = self
            .options
            .map(|o| BASE64.decode(o))
            .transpose()
            .map_err(|e| DomainError::InvalidRawFrame(format!("options: {e}")))?;

        Ok(RawFrame {
            source_address,
            payload,
            received_at: self.received,
            transport_options,
        })
    }
}
