use crate::error::{DomainError, DomainResult};
use crate::repository::DataSink;
use chrono::{DateTime, SecondsFormat};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Record keys that identify the device rather than carry a measurement.
pub const TAG_KEYS: [&str; 3] = ["source_addr", "serial", "name"];

/// Reshape a cooked record into the document the HTTP sink expects:
///
/// `{"tags": {...}, "frames": [{"time": "<RFC 3339>", "data": {...}}]}`
///
/// The time comes from the mote clock (`tst`) when present, otherwise from the
/// reception time.
pub fn data_to_json(record: &Value) -> DomainResult<Value> {
    let mut data = record
        .as_object()
        .cloned()
        .ok_or_else(|| DomainError::InvalidRecord("record is not an object".to_string()))?;

    let mut tags = Map::new();
    for key in TAG_KEYS {
        if let Some(value) = data.remove(key).filter(|v| !v.is_null()) {
            tags.insert(key.to_string(), value);
        }
    }

    let time = match data.remove("tst").filter(|v| !v.is_null()) {
        Some(tst) => tst,
        None => data
            .get("received")
            .cloned()
            .ok_or_else(|| DomainError::InvalidRecord("record has no time".to_string()))?,
    };
    let time = to_rfc3339(&time)?;

    Ok(json!({
        "tags": tags,
        "frames": [{"time": time, "data": data}],
    }))
}

fn to_rfc3339(time: &Value) -> DomainResult<String> {
    let seconds = time
        .as_i64()
        .or_else(|| time.as_f64().map(|t| t as i64))
        .ok_or_else(|| DomainError::InvalidRecord(format!("invalid time {time}")))?;
    DateTime::from_timestamp(seconds, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, false))
        .ok_or_else(|| DomainError::InvalidRecord(format!("time out of range {seconds}")))
}

/// Final stage: posts cooked records to the external store.
pub struct DataForwarder {
    sink: Arc<dyn DataSink>,
}

impl DataForwarder {
    pub fn new(sink: Arc<dyn DataSink>) -> Self {
        Self { sink }
    }

    pub async fn forward(&self, record: &Value) -> DomainResult<()> {
        let document = data_to_json(record)?;
        self.sink.post(&document).await?;
        debug!(tags = %document["tags"], "Record forwarded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockDataSink;

    #[test]
    fn test_tags_are_split_from_data() {
        let record = json!({
            "source_addr": 5526146532104399u64,
            "serial": 1234,
            "name": "finse",
            "type": 0,
            "frame": 7,
            "received": 1_500_000_100,
            "tst": 1_500_000_000,
            "bat": 87,
        });

        let document = data_to_json(&record).unwrap();

        assert_eq!(
            document,
            json!({
                "tags": {"source_addr": 5526146532104399u64, "serial": 1234, "name": "finse"},
                "frames": [{
                    "time": "2017-07-14T02:40:00+00:00",
                    "data": {"type": 0, "frame": 7, "received": 1_500_000_100, "bat": 87},
                }],
            })
        );
    }

    #[test]
    fn test_time_falls_back_to_received() {
        let record = json!({"serial": 1, "received": 0, "in_temp": 21.5});

        let document = data_to_json(&record).unwrap();

        assert_eq!(document["frames"][0]["time"], json!("1970-01-01T00:00:00+00:00"));
        assert_eq!(document["tags"], json!({"serial": 1}));
    }

    #[test]
    fn test_invalid_records() {
        assert!(matches!(
            data_to_json(&json!([1, 2])),
            Err(DomainError::InvalidRecord(_))
        ));
        assert!(matches!(
            data_to_json(&json!({"serial": 1})),
            Err(DomainError::InvalidRecord(_))
        ));
        assert!(matches!(
            data_to_json(&json!({"tst": "yesterday"})),
            Err(DomainError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_posts_document() {
        // Arrange
        let mut mock_sink = MockDataSink::new();
        mock_sink
            .expect_post()
            .withf(|document: &Value| document["tags"]["serial"] == json!(9))
            .times(1)
            .returning(|_| Ok(()));
        let forwarder = DataForwarder::new(Arc::new(mock_sink));

        // Act
        let result = forwarder
            .forward(&json!({"serial": 9, "received": 10}))
            .await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_forward_propagates_downstream_failure() {
        // Arrange
        let mut mock_sink = MockDataSink::new();
        mock_sink.expect_post().times(1).returning(|_| {
            Err(DomainError::DownstreamUnavailable(
                "503 Service Unavailable".to_string(),
            ))
        });
        let forwarder = DataForwarder::new(Arc::new(mock_sink));

        // Act
        let result = forwarder
            .forward(&json!({"serial": 9, "received": 10}))
            .await;

        // Assert
        let err = result.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_invalid_record_is_not_posted() {
        let mut mock_sink = MockDataSink::new();
        mock_sink.expect_post().times(0);
        let forwarder = DataForwarder::new(Arc::new(mock_sink));

        let result = forwarder.forward(&json!("nope")).await;

        assert!(matches!(result, Err(DomainError::InvalidRecord(_))));
    }
}
