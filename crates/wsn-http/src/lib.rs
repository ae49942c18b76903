use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use wsn_domain::{DataSink, DomainError, DomainResult};

/// Where cooked records are posted.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub url: String,
    /// Sent as `Authorization: Token <token>`.
    pub token: Option<String>,
    /// Applies to connecting and to the whole request.
    pub timeout: Duration,
}

/// [`DataSink`] posting JSON documents with reqwest.
///
/// Any failure to get a success status back is reported as
/// [`DomainError::DownstreamUnavailable`], so the consumer pauses and retries.
pub struct HttpDataSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpDataSink {
    pub fn new(config: HttpSinkConfig) -> DomainResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| DomainError::RepositoryError(anyhow::Error::new(e)))?;

        Ok(Self { client, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

fn check_status(status: StatusCode, body: &str) -> DomainResult<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(DomainError::DownstreamUnavailable(format!(
        "{status} {}",
        body.trim()
    )))
}

#[async_trait]
impl DataSink for HttpDataSink {
    async fn post(&self, document: &serde_json::Value) -> DomainResult<()> {
        let mut request = self.client.post(&self.config.url).json(document);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await.map_err(|e| {
            warn!(url = %self.config.url, error = %e, "HTTP sink request failed");
            DomainError::DownstreamUnavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %self.config.url, status = %status, "HTTP sink rejected record");
            return check_status(status, &body);
        }

        debug!(url = %self.config.url, status = %status, "Record posted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accepts one connection, answers with `status_line` and reports the request head.
    async fn one_shot_server(status_line: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/wsn/frames/", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!("{status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (url, rx)
    }

    fn sink(url: String) -> HttpDataSink {
        HttpDataSink::new(HttpSinkConfig {
            url,
            token: Some("secret".to_string()),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::CREATED, "").is_ok());
        assert!(check_status(StatusCode::OK, "").is_ok());
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            Err(DomainError::DownstreamUnavailable(_))
        ));
        assert!(matches!(
            check_status(StatusCode::BAD_REQUEST, "{\"detail\": \"bad\"}"),
            Err(DomainError::DownstreamUnavailable(msg)) if msg.contains("400")
        ));
    }

    #[tokio::test]
    async fn test_post_sends_token_and_accepts_created() {
        // Arrange
        let (url, request) = one_shot_server("HTTP/1.1 201 Created").await;
        let sink = sink(url);

        // Act
        let result = sink.post(&json!({"tags": {}, "frames": []})).await;

        // Assert
        assert!(result.is_ok());
        let head = request.await.unwrap().to_lowercase();
        assert!(head.starts_with("post /api/wsn/frames/ "));
        assert!(head.contains("authorization: token secret"));
        assert!(head.contains("content-type: application/json"));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (url, _request) = one_shot_server("HTTP/1.1 500 Internal Server Error").await;

        let result = sink(url).post(&json!({})).await;

        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_transient() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = sink(format!("http://{addr}/")).post(&json!({})).await;

        assert!(matches!(result, Err(DomainError::DownstreamUnavailable(_))));
    }
}
