//! HTTP transport posting samples to the backend ingestion endpoint.
//!
//! One request per sample with a short, fixed timeout. Any non-2xx status or
//! network error is a failure; retries happen through the local buffer, never
//! here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use super::{SecondaryTransport, TransportError};
use crate::config::Config;
use crate::sample::Sample;

/// HTTP client for `POST <backend_url>/telemetry`.
pub struct HttpTransport {
    /// Pooled client, `None` once closed
    client: Option<Client>,

    /// Full URL for the telemetry endpoint
    telemetry_url: String,

    /// Per-request timeout
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport from the agent configuration.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Self::with_settings(config.telemetry_url.clone(), config.request_timeout)
    }

    /// Create a transport for an explicit endpoint URL.
    ///
    /// # Arguments
    ///
    /// * `telemetry_url` - Full URL samples are POSTed to
    /// * `timeout` - Upper bound on each request, connect included
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the HTTP client cannot be built.
    pub fn with_settings(
        telemetry_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client: Some(client),
            telemetry_url: telemetry_url.into(),
            timeout,
        })
    }

    pub fn telemetry_url(&self) -> &str {
        &self.telemetry_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl SecondaryTransport for HttpTransport {
    async fn send(&self, sample: &Sample) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::Closed)?;

        debug!(url = %self.telemetry_url, "Posting sample");

        let response = client
            .post(&self.telemetry_url)
            .timeout(self.timeout)
            .json(sample)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        Err(TransportError::Status {
            code: status,
            message,
        })
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            info!(url = %self.telemetry_url, "HTTP transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn sample() -> Sample {
        Sample::new(
            "dev-1",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "power",
            1200.0,
            "W",
        )
    }

    /// Serve exactly one request with `status_line`, handing the raw request
    /// text back through the returned channel.
    async fn serve_once(status_line: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            let _ = tx.send(request);
        });

        (format!("http://{addr}/telemetry"), rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn test_transport_from_config() {
        let config = Config::default();
        let transport = HttpTransport::new(&config).unwrap();

        assert_eq!(transport.telemetry_url(), "http://localhost:8000/telemetry");
        assert_eq!(transport.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_posts_sample_json() {
        let (url, request_rx) = serve_once("200 OK").await;
        let transport = HttpTransport::with_settings(url, Duration::from_secs(2)).unwrap();

        transport.send(&sample()).await.unwrap();

        let request = request_rx.await.unwrap();
        assert!(request.starts_with("POST /telemetry HTTP/1.1"));
        assert!(request.contains(r#""device_identifier":"dev-1""#));
        assert!(request.contains(r#""timestamp":"2024-01-01T00:00:00Z""#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let (url, _request_rx) = serve_once("503 Service Unavailable").await;
        let transport = HttpTransport::with_settings(url, Duration::from_secs(2)).unwrap();

        let err = transport.send(&sample()).await.unwrap_err();
        match err {
            TransportError::Status { code, .. } => assert_eq!(code.as_u16(), 503),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::with_settings(format!("http://{addr}/telemetry"), Duration::from_secs(2))
                .unwrap();

        assert!(matches!(
            transport.send(&sample()).await,
            Err(TransportError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = HttpTransport::with_settings(
            format!("http://{addr}/telemetry"),
            Duration::from_millis(200),
        )
        .unwrap();

        assert!(matches!(
            transport.send(&sample()).await,
            Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mut transport =
            HttpTransport::with_settings("http://127.0.0.1:9/telemetry", Duration::from_secs(1))
                .unwrap();

        transport.close().await;
        transport.close().await;

        assert!(matches!(
            transport.send(&sample()).await,
            Err(TransportError::Closed)
        ));
    }
}
