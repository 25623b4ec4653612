//! Service configuration from environment variables

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Everything the binary needs to wire itself up. Defaults come from the
/// environment; `validate` runs once at startup so a missing credential
/// fails fast instead of on the first job.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Chat platform app credentials
    pub app_id: String,
    pub app_secret: String,
    /// Webhook verification token; empty disables the check
    pub verification_token: String,
    /// Chat platform API origin
    pub domain: String,
    /// Multimodal analysis endpoint and credentials
    pub analysis_endpoint: String,
    pub analysis_api_key: String,
    pub analysis_model: String,
    /// Speech-recognition endpoint and credentials; the key falls back to
    /// the analysis key when the provider shares it
    pub asr_endpoint: String,
    pub asr_api_key: String,
    pub asr_model: String,
    /// Path to the ffmpeg executable
    pub ffmpeg_path: PathBuf,
    pub bind_addr: String,
    /// Root for per-job work directories
    pub work_root: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_id: std::env::var("CHAT_APP_ID").unwrap_or_default(),
            app_secret: std::env::var("CHAT_APP_SECRET").unwrap_or_default(),
            verification_token: std::env::var("CHAT_VERIFICATION_TOKEN").unwrap_or_default(),
            domain: std::env::var("CHAT_DOMAIN")
                .unwrap_or_else(|_| "https://open.feishu.cn".to_string()),
            analysis_endpoint: std::env::var("ANALYSIS_ENDPOINT").unwrap_or_else(|_| {
                "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generation"
                    .to_string()
            }),
            analysis_api_key: std::env::var("ANALYSIS_API_KEY").unwrap_or_default(),
            analysis_model: std::env::var("ANALYSIS_MODEL")
                .unwrap_or_else(|_| "qwen-vl-max".to_string()),
            asr_endpoint: std::env::var("ASR_ENDPOINT").unwrap_or_else(|_| {
                "https://dashscope.aliyuncs.com/api/v1/services/audio/asr/transcription"
                    .to_string()
            }),
            asr_api_key: std::env::var("ASR_API_KEY")
                .or_else(|_| std::env::var("ANALYSIS_API_KEY"))
                .unwrap_or_default(),
            asr_model: std::env::var("ASR_MODEL")
                .unwrap_or_else(|_| "paraformer-v2".to_string()),
            ffmpeg_path: std::env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("ffmpeg")),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            work_root: std::env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("video-insight")),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            bail!("CHAT_APP_ID is not set");
        }
        if self.app_secret.is_empty() {
            bail!("CHAT_APP_SECRET is not set");
        }
        if self.analysis_api_key.is_empty() {
            bail!("ANALYSIS_API_KEY is not set");
        }
        Ok(())
    }
}
