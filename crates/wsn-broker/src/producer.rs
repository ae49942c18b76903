use crate::client::BrokerClient;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use wsn_domain::error::{DomainError, DomainResult};
use wsn_domain::{FramePublisher, RawFrame, RawFramePublisher};
use wsn_payload::DecodedFrame;

/// Publishes JSON bodies to one exchange.
pub struct BrokerPublisher {
    client: Arc<dyn BrokerClient>,
    exchange: String,
    routing_key: String,
}

impl BrokerPublisher {
    pub fn new(client: Arc<dyn BrokerClient>, exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        info!(exchange = %exchange, "Created broker publisher");
        Self {
            client,
            exchange,
            routing_key: String::new(),
        }
    }

    /// Route to a single queue of a direct exchange.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub async fn publish_json(&self, body: &serde_json::Value) -> DomainResult<()> {
        let payload = serde_json::to_vec(body)
            .context("Failed to serialize message body")
            .map_err(DomainError::RepositoryError)?;

        debug!(
            exchange = %self.exchange,
            size_bytes = payload.len(),
            "Publishing message"
        );

        self.client
            .publish(&self.exchange, &self.routing_key, payload.into())
            .await
            .context("Failed to publish and acknowledge message")
            .map_err(DomainError::RepositoryError)
    }
}

#[async_trait]
impl FramePublisher for BrokerPublisher {
    async fn publish_frame(&self, frame: &DecodedFrame) -> DomainResult<()> {
        self.publish_json(&frame.to_json()).await?;
        debug!(serial = frame.serial, frame = frame.frame_sequence, "Published decoded frame");
        Ok(())
    }
}

#[async_trait]
impl RawFramePublisher for BrokerPublisher {
    async fn publish_raw(&self, frame: &RawFrame) -> DomainResult<()> {
        self.publish_json(&frame.to_json()).await?;
        debug!(address = %frame.address_hex(), "Published raw frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBrokerClient;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_publish_raw_frame() {
        // Arrange
        let mut mock_client = MockBrokerClient::new();
        mock_client
            .expect_publish()
            .withf(|exchange: &str, routing_key: &str, body: &Bytes| {
                let body: serde_json::Value = serde_json::from_slice(body).unwrap();
                exchange == "wsn_raw"
                    && routing_key.is_empty()
                    && body["id"] == "rx"
                    && body["source_addr"] == "0013A2004105D8CF"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher = BrokerPublisher::new(Arc::new(mock_client), "wsn_raw");
        let frame = RawFrame::new(
            vec![0x00, 0x13, 0xA2, 0x00, 0x41, 0x05, 0xD8, 0xCF],
            b"<=>abc".to_vec(),
            1_500_000_000,
        );

        // Act
        let result = publisher.publish_raw(&frame).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_publish_failure() {
        // Arrange
        let mut mock_client = MockBrokerClient::new();
        mock_client
            .expect_publish()
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("NATS publish failed")));

        let publisher = BrokerPublisher::new(Arc::new(mock_client), "wsn_data");
        let frame = DecodedFrame::new(0, 1234, 7);

        // Act
        let result = publisher.publish_frame(&frame).await;

        // Assert
        assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    }

    #[tokio::test]
    async fn test_routing_key_is_used() {
        let mut mock_client = MockBrokerClient::new();
        mock_client
            .expect_publish()
            .withf(|_exchange: &str, routing_key: &str, _body: &Bytes| routing_key == "motes")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let publisher =
            BrokerPublisher::new(Arc::new(mock_client), "wsn_cmd").with_routing_key("motes");

        assert!(publisher.publish_json(&serde_json::json!({})).await.is_ok());
    }
}
