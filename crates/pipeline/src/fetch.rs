//! Media fetching collaborator
//!
//! Streams remote media to a local path. Acquire decides concurrency and
//! the skip-if-present check; the fetcher only moves bytes.

use async_trait::async_trait;
use futures::StreamExt;
use insight_common::StageError;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), StageError>;
}

/// Production fetcher streaming over HTTP. A partial download is removed
/// so a retry never mistakes it for a completed file.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpMediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), StageError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StageError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(StageError::permanent(format!("media link returned {status}")));
        }
        if !status.is_success() {
            return Err(StageError::transient(format!("media host returned {status}")));
        }

        let write_result: Result<(), StageError> = async {
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| StageError::transient(format!("cannot create {}: {e}", dest.display())))?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| StageError::transient(format!("stream interrupted: {e}")))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| StageError::transient(format!("write failed: {e}")))?;
            }
            file.flush()
                .await
                .map_err(|e| StageError::transient(format!("flush failed: {e}")))?;
            Ok(())
        }
        .await;

        if write_result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        } else {
            debug!(url, dest = %dest.display(), "media fetched");
        }
        write_result
    }
}

/// Strip characters the filesystem rejects from a material name.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "unnamed_video".to_string()
    } else {
        cleaned
    }
}
