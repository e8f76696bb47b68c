//! Fetching service descriptors over HTTP

use std::time::Duration;
use async_trait::async_trait;
use reqwest::Client;
use shared::protocol::DESCRIPTOR_TIMEOUT;
use shared::types::{canonical_uri, Descriptor, DiscoveryKind, ServiceRecord};
use crate::error::{Result, SearchError};

/// Retrieves the descriptor a service publishes at its endpoint URI.
///
/// Also used as the liveness probe for LAN services: any error means
/// "not alive".
#[async_trait]
pub trait DescriptorFetcher: Send + Sync + 'static {
    async fn fetch(&self, uri: &str, timeout: Duration) -> Result<Descriptor>;
}

/// `DescriptorFetcher` backed by a shared reqwest client
#[derive(Clone, Default)]
pub struct HttpDescriptorFetcher {
    client: Client,
}

impl HttpDescriptorFetcher {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DescriptorFetcher for HttpDescriptorFetcher {
    async fn fetch(&self, uri: &str, timeout: Duration) -> Result<Descriptor> {
        tracing::debug!(uri, ?timeout, "Fetching descriptor");

        let response = self
            .client
            .get(uri)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SearchError::from_reqwest(uri, timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::HttpStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SearchError::from_reqwest(uri, timeout, e))?;

        serde_json::from_slice(&body).map_err(|e| SearchError::MalformedDescriptor {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Resolves a single service directly from its URI, without a search.
pub async fn get_by_uri(
    fetcher: &dyn DescriptorFetcher,
    uri: &str,
    kind: DiscoveryKind,
) -> Result<ServiceRecord> {
    let uri = canonical_uri(uri);
    let descriptor = fetcher.fetch(&uri, DESCRIPTOR_TIMEOUT).await?;
    Ok(ServiceRecord::from_descriptor(&uri, kind, descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use shared::types::DeviceInfo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and returns the base URI.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });

        format!("http://{}/api/v2/", addr)
    }

    #[tokio::test]
    async fn test_fetch_descriptor() {
        let uri = serve_once(
            "200 OK",
            r#"{"id":"tv-42","uri":"http://10.0.0.5:8001/api/v2/","version":"2.0","name":"Living Room TV","device":{"type":"TV"}}"#,
        )
        .await;

        let descriptor = HttpDescriptorFetcher::new()
            .fetch(&uri, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(descriptor.id, "tv-42");
        assert_eq!(descriptor.name.as_deref(), Some("Living Room TV"));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let uri = serve_once("404 Not Found", "").await;

        let err = HttpDescriptorFetcher::new()
            .fetch(&uri, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SearchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let uri = serve_once("200 OK", r#"{"id":"tv-42"}"#).await;

        let err = HttpDescriptorFetcher::new()
            .fetch(&uri, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SearchError::MalformedDescriptor { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without answering
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = HttpDescriptorFetcher::new()
            .fetch(&format!("http://{}/", addr), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, SearchError::Timeout(_)));
    }

    #[derive(Default)]
    struct RecordingFetcher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DescriptorFetcher for RecordingFetcher {
        async fn fetch(&self, uri: &str, _timeout: Duration) -> Result<Descriptor> {
            self.seen.lock().unwrap().push(uri.to_string());
            Ok(Descriptor {
                id: "tv-42".to_string(),
                uri: uri.to_string(),
                version: "2.0".to_string(),
                name: None,
                device: DeviceInfo {
                    device_type: "TV".to_string(),
                },
            })
        }
    }

    #[tokio::test]
    async fn test_get_by_uri_fetches_canonical_uri() {
        let fetcher = RecordingFetcher::default();

        let record = get_by_uri(&fetcher, "  HTTP://10.0.0.5:8001/API/V2/ ", DiscoveryKind::Lan)
            .await
            .unwrap();

        assert_eq!(
            *fetcher.seen.lock().unwrap(),
            vec!["http://10.0.0.5:8001/api/v2/".to_string()]
        );
        assert_eq!(record.uri, "http://10.0.0.5:8001/api/v2/");
        assert_eq!(record.name, "Unknown Device");
        assert_eq!(record.kind, DiscoveryKind::Lan);
    }
}
