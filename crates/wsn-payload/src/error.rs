use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// Fewer bytes remain than the next field declares. Retry once more bytes arrive.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    TruncatedFrame { needed: usize, available: usize },

    #[error("unknown sensor id: {0}")]
    UnknownSensor(u64),

    #[error("integrity check failed: {0}")]
    IntegrityError(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("encrypted frame received but no cipher key is configured")]
    MissingKey,
}

impl DecodeError {
    pub fn truncated(needed: usize, available: usize) -> Self {
        Self::TruncatedFrame { needed, available }
    }

    /// Only truncation is worth retrying; every other failure is permanent for the bytes at hand.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TruncatedFrame { .. })
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
