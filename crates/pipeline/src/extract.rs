//! Signal extraction collaborator
//!
//! Derives an audio track and a tiled frame sheet from a media file by
//! shelling out to ffmpeg. Speech transcription of the audio track runs
//! behind the separate [`crate::Transcriber`] seam; the extractor only
//! produces the signals fed into it and into analysis.

use async_trait::async_trait;
use insight_common::StageError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Signals derived from one media file.
#[derive(Debug, Clone)]
pub struct ExtractedSignals {
    /// Mono 16 kHz wav, fed to the transcriber
    pub audio: PathBuf,
    /// Single jpeg tiling frames sampled across the video
    pub frame_sheet: PathBuf,
}

#[async_trait]
pub trait SignalExtractor: Send + Sync {
    /// Derive signals for `media` into `out_dir`. Must be idempotent:
    /// existing outputs in `out_dir` are reused.
    async fn extract(&self, media: &Path, out_dir: &Path) -> Result<ExtractedSignals, StageError>;
}

/// Extractor driving an ffmpeg executable.
pub struct CommandExtractor {
    ffmpeg: PathBuf,
}

impl CommandExtractor {
    #[must_use]
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    async fn run_ffmpeg(&self, args: &[&str]) -> Result<(), StageError> {
        debug!(ffmpeg = %self.ffmpeg.display(), ?args, "running extractor");
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StageError::transient(format!("failed to launch extractor: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
        // Corrupt input never recovers on retry; everything else might.
        if stderr.contains("Invalid data found") || stderr.contains("moov atom not found") {
            Err(StageError::permanent(format!("unreadable media: {tail}")))
        } else {
            Err(StageError::transient(format!(
                "extractor exited with {}: {tail}",
                output.status
            )))
        }
    }
}

fn exists_nonempty(path: &Path) -> bool {
    path.metadata().map(|m| m.len() > 0).unwrap_or(false)
}

#[async_trait]
impl SignalExtractor for CommandExtractor {
    async fn extract(&self, media: &Path, out_dir: &Path) -> Result<ExtractedSignals, StageError> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| StageError::transient(format!("cannot create {}: {e}", out_dir.display())))?;

        let media_str = media
            .to_str()
            .ok_or_else(|| StageError::permanent("media path is not valid utf-8".to_string()))?;

        let audio = out_dir.join("audio.wav");
        if !exists_nonempty(&audio) {
            let audio_str = audio.to_string_lossy().to_string();
            self.run_ffmpeg(&[
                "-y", "-i", media_str, "-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1",
                &audio_str,
            ])
            .await?;
        }

        let frame_sheet = out_dir.join("frame_sheet.jpg");
        if !exists_nonempty(&frame_sheet) {
            let sheet_str = frame_sheet.to_string_lossy().to_string();
            self.run_ffmpeg(&[
                "-y",
                "-i",
                media_str,
                "-vf",
                "fps=1/2,scale=320:-1,tile=4x4",
                "-frames:v",
                "1",
                "-q:v",
                "3",
                &sheet_str,
            ])
            .await?;
        }

        Ok(ExtractedSignals { audio, frame_sheet })
    }
}
