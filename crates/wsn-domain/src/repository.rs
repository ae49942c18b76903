use crate::error::DomainResult;
use crate::raw_frame::RawFrame;
use async_trait::async_trait;
use wsn_payload::DecodedFrame;

/// Publishes decoded frames to the data exchange.
/// Infrastructure layer (e.g., wsn-broker) implements this trait
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FramePublisher: Send + Sync {
    async fn publish_frame(&self, frame: &DecodedFrame) -> DomainResult<()>;
}

/// Publishes raw frames to the raw exchange.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RawFramePublisher: Send + Sync {
    async fn publish_raw(&self, frame: &RawFrame) -> DomainResult<()>;
}

/// Outbound path to the motes (acks, time sync, RSSI polls).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send(&self, address: &[u8], command: &[u8]) -> DomainResult<()>;
}

/// External store the cooked records end up in.
/// Implementations must report outages as `DomainError::DownstreamUnavailable`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DataSink: Send + Sync {
    async fn post(&self, document: &serde_json::Value) -> DomainResult<()>;
}
