//! Speech transcription collaborator
//!
//! Turns the extracted audio track into the spoken-copy transcript the
//! analysis prompt carries. Transcription enriches an item; it never fails
//! one — a transcription error leaves the transcript empty and the item
//! continues through the pipeline.

use async_trait::async_trait;
use base64::Engine;
use insight_common::StageError;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the audio file. `Ok(None)` means no speech was detected.
    async fn transcribe(&self, audio: &Path) -> Result<Option<String>, StageError>;
}

#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

/// Production [`Transcriber`] over a speech-recognition API.
pub struct SpeechTranscriber {
    config: TranscriberConfig,
    client: reqwest::Client,
}

impl SpeechTranscriber {
    #[must_use]
    pub fn new(config: TranscriberConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

/// Recognizers return an empty or whitespace string for silent audio.
fn clean_transcript(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[async_trait]
impl Transcriber for SpeechTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<Option<String>, StageError> {
        let audio_bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| StageError::permanent(format!("audio track unreadable: {e}")))?;
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(audio_bytes);

        let payload = json!({
            "model": self.config.model,
            "input": {
                "audio": format!("data:audio/wav;base64,{audio_b64}"),
            }
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| StageError::transient(format!("transcription request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(StageError::transient(format!("speech api returned {status}")));
        }
        if !status.is_success() {
            return Err(StageError::permanent(format!(
                "speech api rejected request: {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("speech response unreadable: {e}")))?;
        let text = body["output"]["text"].as_str().ok_or_else(|| {
            StageError::permanent(format!("unexpected speech response shape: {body}"))
        })?;

        let transcript = clean_transcript(text);
        debug!(
            audio = %audio.display(),
            spoken = transcript.is_some(),
            "transcription complete"
        );
        Ok(transcript)
    }
}
