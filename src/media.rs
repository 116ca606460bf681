use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, error};

use crate::db::{DatabaseManager, UploadCorrelation};
use crate::parsers::AttachmentMirror;
use crate::zulip::ZulipClient;

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub size: usize,
}

/// Copies Discord attachments onto the Zulip server, once per source url.
pub struct UploadMirror {
    http: Client,
    zulip: Arc<ZulipClient>,
    db: DatabaseManager,
    max_bytes: u64,
}

impl UploadMirror {
    pub fn new(zulip: Arc<ZulipClient>, db: DatabaseManager, max_bytes: u64) -> Self {
        Self {
            http: Client::new(),
            zulip,
            db,
            max_bytes,
        }
    }

    pub async fn download(&self, url: &str) -> Result<MediaInfo> {
        debug!("downloading media from {}", url);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow!("failed to download from {}: {}", url, e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "failed to download from {}: status {}",
                url,
                response.status()
            ));
        }
        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let data = response
            .bytes()
            .await
            .map_err(|e| anyhow!("failed to read response body: {}", e))?
            .to_vec();
        self.check_size(data.len() as u64)?;

        debug!("downloaded {} bytes from {}", data.len(), url);
        Ok(MediaInfo {
            size: data.len(),
            data,
            content_type,
        })
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(anyhow!(
                "file too large for Zulip: {} bytes (max {})",
                size,
                self.max_bytes
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AttachmentMirror for UploadMirror {
    async fn mirror(
        &self,
        source_url: &str,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<String> {
        let uploads = self.db.upload_store();
        if let Some(existing) = uploads.get_by_source_url(source_url).await? {
            debug!(source_url, mirrored = %existing.mirrored_file_url, "reusing mirrored upload");
            return Ok(existing.mirrored_file_url);
        }

        let media = self.download(source_url).await?;
        let content_type = content_type.or(media.content_type.as_deref());
        let uploaded = self
            .zulip
            .upload_file(filename, media.data, content_type)
            .await
            .map_err(|e| anyhow!("failed to upload {} to zulip: {}", filename, e))?;
        debug!(source_url, mirrored = %uploaded.url, size = media.size, "mirrored upload");

        let record = UploadCorrelation {
            id: 0,
            source_file_url: source_url.to_string(),
            mirrored_file_url: uploaded.url.clone(),
            mirrored_file_id: None,
            created_at: Utc::now(),
        };
        if let Err(e) = uploads.insert_upload(&record).await {
            error!(source_url, mirrored = %uploaded.url, error = %e, "failed to record upload correlation");
        }
        Ok(uploaded.url)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::UploadMirror;
    use crate::config::ZulipConfig;
    use crate::db::memory::MemoryStore;
    use crate::parsers::AttachmentMirror;
    use crate::zulip::ZulipClient;

    fn zulip_for(server: &mockito::ServerGuard) -> Arc<ZulipClient> {
        let config = ZulipConfig {
            realm: server.url(),
            email: "bridge-bot@chat.example.org".to_string(),
            api_key: "secret-key".to_string(),
            bot_user_id: 42,
            poll_delay_ms: 1,
            startup_retries: 1,
            request_timeout_secs: 5,
            max_message_length: 10_000,
            max_file_upload_size_mib: 10,
        };
        Arc::new(ZulipClient::new(&config).expect("client builds"))
    }

    #[tokio::test]
    async fn identical_sources_are_uploaded_once() {
        let mut server = mockito::Server::new_async().await;
        let download = server
            .mock("GET", "/attachments/cat.png")
            .with_header("content-type", "image/png")
            .with_body(b"\x89PNG")
            .expect(1)
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/api/v1/user_uploads")
            .with_header("content-type", "application/json")
            .with_body(r#"{"result":"success","msg":"","uri":"/user_uploads/2/ab/cat.png"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = MemoryStore::new();
        let mirror = UploadMirror::new(zulip_for(&server), store.manager(), 1024);
        let source = format!("{}/attachments/cat.png", server.url());

        let first = mirror.mirror(&source, "cat.png", None).await.expect("mirrored");
        let second = mirror.mirror(&source, "cat.png", None).await.expect("reused");

        assert_eq!(first, "/user_uploads/2/ab/cat.png");
        assert_eq!(second, first);
        assert_eq!(store.uploads().len(), 1);
        download.assert_async().await;
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn oversized_files_are_not_uploaded() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/attachments/big.bin")
            .with_body(vec![0u8; 64])
            .create_async()
            .await;
        let upload = server
            .mock("POST", "/api/v1/user_uploads")
            .expect(0)
            .create_async()
            .await;

        let store = MemoryStore::new();
        let mirror = UploadMirror::new(zulip_for(&server), store.manager(), 16);
        let source = format!("{}/attachments/big.bin", server.url());

        let err = mirror
            .mirror(&source, "big.bin", None)
            .await
            .expect_err("too large");

        assert!(err.to_string().contains("too large"));
        assert!(store.uploads().is_empty());
        upload.assert_async().await;
    }
}
