//! The four stage executors
//!
//! Executors mutate the stage payload: acquire populates items, extract and
//! analyze enrich them, persist writes them out. Per-item failures mark the
//! item and continue; stage-level errors abort the attempt and surface to
//! the orchestrator's retry loop.

use crate::analyze::{AnalysisClient, AnalysisRequest};
use crate::extract::SignalExtractor;
use crate::fetch::{sanitize_filename, MediaFetcher};
use crate::table::{ResultRow, TableStore, FIELD_NAME, FIELD_URL};
use crate::transcribe::Transcriber;
use crate::{MediaItem, Stage, StageContext, StageOutput, MAX_WORKERS};
use async_trait::async_trait;
use futures::future::join_all;
use insight_common::{ArtifactId, StageError, StageKind};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

/// Fetch every source row's media into the job work dir.
pub struct AcquireStage {
    table: Arc<dyn TableStore>,
    fetcher: Arc<dyn MediaFetcher>,
}

impl AcquireStage {
    #[must_use]
    pub fn new(table: Arc<dyn TableStore>, fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self { table, fetcher }
    }
}

#[async_trait]
impl Stage for AcquireStage {
    fn kind(&self) -> StageKind {
        StageKind::Acquire
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let rows = self.table.list_rows(&ctx.config.source).await?;

        let mut items: Vec<MediaItem> = rows
            .iter()
            .filter_map(|row| {
                let name = row.name()?;
                let url = row.media_url()?;
                Some(MediaItem::new(name, url, row.metrics()))
            })
            .collect();
        if items.is_empty() {
            return Err(StageError::permanent(
                "no usable media links in source table".to_string(),
            ));
        }
        info!(total = rows.len(), usable = items.len(), "source rows listed");

        let media_dir = ctx.work_dir.join("media");
        tokio::fs::create_dir_all(&media_dir)
            .await
            .map_err(|e| StageError::transient(format!("cannot create work dir: {e}")))?;

        let semaphore = Arc::new(Semaphore::new(MAX_WORKERS));
        let registered: Arc<Mutex<Vec<ArtifactId>>> = Arc::new(Mutex::new(Vec::new()));

        let fetches = items.iter().map(|item| {
            let semaphore = semaphore.clone();
            let registered = registered.clone();
            let fetcher = self.fetcher.clone();
            let dest = media_dir.join(format!("{}.mp4", sanitize_filename(&item.name)));
            let url = item.url.clone();
            let name = item.name.clone();
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                if ctx.cancelled.load(Ordering::Relaxed) {
                    return Some((dest, Ok(())));
                }
                // A completed download from an earlier attempt is reused.
                if dest.metadata().map(|m| m.len() > 0).unwrap_or(false) {
                    return Some((dest, Ok(())));
                }
                let result = fetcher.fetch(&url, &dest).await;
                if result.is_ok() {
                    let id = ctx.artifacts.register(ctx.job_id, &dest).await;
                    registered.lock().await.push(id);
                } else {
                    warn!(item = %name, "media fetch failed");
                }
                Some((dest, result))
            }
        });
        let results = join_all(fetches).await;

        for (item, result) in items.iter_mut().zip(results) {
            match result {
                Some((dest, Ok(()))) => item.media = Some(dest),
                Some((_, Err(e))) => item.fail(format!("fetch failed: {e}")),
                None => item.fail("fetch slot unavailable"),
            }
        }

        let mut payload = ctx.payload.clone();
        payload.items = items;
        let counts = payload.tally();
        if counts.ok == 0 {
            return Err(StageError::permanent(format!(
                "all {} media fetches failed",
                counts.failed
            )));
        }

        let artifacts = registered.lock().await.clone();
        Ok(StageOutput {
            items: counts,
            payload,
            artifacts,
        })
    }
}

/// Derive audio and frame-sheet signals per acquired item, then transcribe
/// the audio into the spoken copy the analysis prompt carries.
pub struct ExtractStage {
    extractor: Arc<dyn SignalExtractor>,
    transcriber: Arc<dyn Transcriber>,
}

impl ExtractStage {
    #[must_use]
    pub fn new(extractor: Arc<dyn SignalExtractor>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            extractor,
            transcriber,
        }
    }
}

#[async_trait]
impl Stage for ExtractStage {
    fn kind(&self) -> StageKind {
        StageKind::Extract
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let mut payload = ctx.payload.clone();
        let mut artifacts = Vec::new();

        for item in payload.items.iter_mut() {
            if !item.is_ready() || ctx.cancelled.load(Ordering::Relaxed) {
                continue;
            }
            let Some(media) = item.media.clone() else {
                item.fail("no media file to extract from");
                continue;
            };

            let out_dir = ctx
                .work_dir
                .join("derived")
                .join(sanitize_filename(&item.name));
            match self.extractor.extract(&media, &out_dir).await {
                Ok(signals) => {
                    artifacts.push(ctx.artifacts.register(ctx.job_id, &signals.audio).await);
                    artifacts
                        .push(ctx.artifacts.register(ctx.job_id, &signals.frame_sheet).await);
                    // Best effort: a failed transcription leaves the item
                    // without spoken copy, it never drops the item.
                    match self.transcriber.transcribe(&signals.audio).await {
                        Ok(transcript) => item.transcript = transcript,
                        Err(e) => {
                            warn!(item = %item.name, error = %e, "transcription failed");
                        }
                    }
                    item.audio = Some(signals.audio);
                    item.frame_sheet = Some(signals.frame_sheet);
                }
                Err(e) if e.is_transient() => {
                    // The whole attempt retries; completed items skip their
                    // work through the extractor's output reuse.
                    return Err(e);
                }
                Err(e) => {
                    warn!(item = %item.name, error = %e, "item not extractable");
                    item.fail(format!("extraction failed: {e}"));
                }
            }
        }

        let counts = payload.tally();
        Ok(StageOutput {
            items: counts,
            payload,
            artifacts,
        })
    }
}

/// Per-item retry ceiling inside the analyze stage.
const ANALYZE_ATTEMPTS: u32 = 3;

/// Run the multimodal model over each extracted item.
pub struct AnalyzeStage {
    analyzer: Arc<dyn AnalysisClient>,
    retry_delay: Duration,
}

impl AnalyzeStage {
    #[must_use]
    pub fn new(analyzer: Arc<dyn AnalysisClient>) -> Self {
        Self {
            analyzer,
            retry_delay: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl Stage for AnalyzeStage {
    fn kind(&self) -> StageKind {
        StageKind::Analyze
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let mut payload = ctx.payload.clone();
        let semaphore = Arc::new(Semaphore::new(MAX_WORKERS));

        let analyses = payload.items.iter().map(|item| {
            let semaphore = semaphore.clone();
            let analyzer = self.analyzer.clone();
            let retry_delay = self.retry_delay;
            async move {
                if !item.is_ready() {
                    return None;
                }
                let Some(frame_sheet) = item.frame_sheet.as_deref() else {
                    return Some(Err("no frame sheet for analysis".to_string()));
                };
                let _permit = semaphore.acquire().await.ok()?;
                if ctx.cancelled.load(Ordering::Relaxed) {
                    return None;
                }

                let request = AnalysisRequest {
                    name: &item.name,
                    frame_sheet,
                    transcript: item.transcript.as_deref(),
                    metrics: &item.metrics,
                    field_rules: &ctx.config.field_rules,
                };
                let mut last_error = String::new();
                for attempt in 1..=ANALYZE_ATTEMPTS {
                    match analyzer.analyze(&request).await {
                        Ok(row) => return Some(Ok(row)),
                        Err(e) if e.is_transient() && attempt < ANALYZE_ATTEMPTS => {
                            warn!(item = %item.name, attempt, error = %e, "analysis attempt failed");
                            tokio::time::sleep(retry_delay).await;
                            last_error = e.to_string();
                        }
                        Err(e) => return Some(Err(e.to_string())),
                    }
                }
                Some(Err(last_error))
            }
        });
        let results = join_all(analyses).await;

        for (item, result) in payload.items.iter_mut().zip(results) {
            match result {
                Some(Ok(row)) => item.analysis = Some(row),
                Some(Err(reason)) => {
                    // One bad item never sinks the batch.
                    item.fail(format!("analysis failed: {reason}"));
                }
                None => {}
            }
        }

        let counts = payload.tally();
        info!(ok = counts.ok, failed = counts.failed, "analysis pass complete");
        Ok(StageOutput {
            items: counts,
            payload,
            artifacts: Vec::new(),
        })
    }
}

/// Upsert analysis rows into the provisioned destination table.
pub struct PersistStage {
    table: Arc<dyn TableStore>,
}

impl PersistStage {
    #[must_use]
    pub fn new(table: Arc<dyn TableStore>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Stage for PersistStage {
    fn kind(&self) -> StageKind {
        StageKind::Persist
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let payload = ctx.payload.clone();
        let destination = payload
            .destination
            .as_ref()
            .ok_or_else(|| StageError::permanent("destination table was never provisioned".to_string()))?;

        let rows: Vec<ResultRow> = payload
            .items
            .iter()
            .filter(|item| item.is_ready())
            .filter_map(|item| {
                let mut fields = item.analysis.clone()?;
                fields.insert(FIELD_NAME.to_string(), Value::String(item.name.clone()));
                fields.insert(
                    FIELD_URL.to_string(),
                    json!({ "text": item.url, "link": item.url }),
                );
                Some(ResultRow {
                    key: item.name.clone(),
                    fields,
                })
            })
            .collect();

        if rows.is_empty() {
            warn!("no analysis rows to persist");
        } else {
            // Upserts are keyed by material name, so a batch retry after a
            // partial write re-writes instead of duplicating.
            self.table.upsert_rows(&destination.table, &rows).await?;
        }

        let counts = payload.tally();
        Ok(StageOutput {
            items: counts,
            payload,
            artifacts: Vec::new(),
        })
    }
}
