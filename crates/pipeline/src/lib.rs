//! Pipeline stage contract and the four stage executors
//!
//! A job runs the fixed sequence acquire, extract, analyze, persist. Each
//! executor implements [`Stage`] over collaborator traits (table store,
//! media fetcher, signal extractor, analysis client); the orchestrator owns
//! sequencing, retry, and timeout. Executors report per-item outcomes and
//! register every file they create with the artifact manager before
//! returning.

use async_trait::async_trait;
use insight_artifacts::ArtifactManager;
use insight_common::job::ItemCounts;
use insight_common::{ArtifactId, JobConfiguration, JobId, SessionId, StageError, StageKind, TableRef};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub mod analyze;
pub mod extract;
pub mod fetch;
pub mod stages;
pub mod table;
pub mod transcribe;

pub use analyze::{AnalysisClient, AnalysisConfig, AnalysisRequest, AnalysisRow, VisionAnalysisClient};
pub use extract::{CommandExtractor, ExtractedSignals, SignalExtractor};
pub use fetch::{HttpMediaFetcher, MediaFetcher};
pub use stages::{AcquireStage, AnalyzeStage, ExtractStage, PersistStage};
pub use table::{BitableConfig, BitableStore, ResultRow, SourceRow, TableStore};
pub use transcribe::{SpeechTranscriber, Transcriber, TranscriberConfig};

/// Per-stage concurrency cap for item-level work.
pub const MAX_WORKERS: usize = 5;

/// Processing state of one media item as it moves through the stages.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    /// Healthy, eligible for the next stage
    Ready,
    /// Dropped with a reason; carried through for the final tally
    Failed(String),
}

/// One source row's media item and everything derived from it.
#[derive(Debug, Clone)]
pub struct MediaItem {
    /// Stable key, the source row's material name
    pub name: String,
    pub url: String,
    /// Delivery metrics copied from the source row, fed to analysis
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub state: ItemState,
    pub media: Option<PathBuf>,
    pub audio: Option<PathBuf>,
    pub frame_sheet: Option<PathBuf>,
    pub transcript: Option<String>,
    pub analysis: Option<AnalysisRow>,
}

impl MediaItem {
    #[must_use]
    pub fn new(name: String, url: String, metrics: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            name,
            url,
            metrics,
            state: ItemState::Ready,
            media: None,
            audio: None,
            frame_sheet: None,
            transcript: None,
            analysis: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = ItemState::Failed(reason.into());
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ItemState::Ready
    }
}

/// Provisioned destination table plus its shareable link.
#[derive(Debug, Clone)]
pub struct Destination {
    pub table: TableRef,
    pub url: String,
}

/// Data flowing between stages. Cloned per attempt so a retried stage
/// always starts from the same input.
#[derive(Debug, Clone, Default)]
pub struct StagePayload {
    pub destination: Option<Destination>,
    pub items: Vec<MediaItem>,
}

impl StagePayload {
    /// Tally item states into the counts carried on the stage result.
    #[must_use]
    pub fn tally(&self) -> ItemCounts {
        let mut counts = ItemCounts::default();
        for item in &self.items {
            match &item.state {
                ItemState::Ready => counts.ok += 1,
                ItemState::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }
}

/// Everything an executor needs for one attempt.
pub struct StageContext {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub config: Arc<JobConfiguration>,
    pub artifacts: ArtifactManager,
    /// Job-scoped directory for fetched and derived files
    pub work_dir: PathBuf,
    /// Checked between item batches; the orchestrator also checks at
    /// stage boundaries
    pub cancelled: Arc<AtomicBool>,
    pub payload: StagePayload,
}

/// Result of a successful stage attempt.
#[derive(Debug)]
pub struct StageOutput {
    pub payload: StagePayload,
    pub items: ItemCounts,
    pub artifacts: Vec<ArtifactId>,
}

/// One pipeline stage. Implementations must be idempotent per attempt:
/// work already done for an item (file fetched, signals derived, row
/// written) is skipped, not repeated.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

/// Collaborator handles shared by the stage executors.
#[derive(Clone)]
pub struct PipelineDeps {
    pub table: Arc<dyn TableStore>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub extractor: Arc<dyn SignalExtractor>,
    pub transcriber: Arc<dyn Transcriber>,
    pub analyzer: Arc<dyn AnalysisClient>,
}

impl PipelineDeps {
    /// Build the executors in pipeline order.
    #[must_use]
    pub fn stages(&self) -> Vec<Box<dyn Stage>> {
        vec![
            Box::new(AcquireStage::new(self.table.clone(), self.fetcher.clone())),
            Box::new(ExtractStage::new(
                self.extractor.clone(),
                self.transcriber.clone(),
            )),
            Box::new(AnalyzeStage::new(self.analyzer.clone())),
            Box::new(PersistStage::new(self.table.clone())),
        ]
    }

    /// Create and prepare the destination table before the pipeline runs:
    /// a fresh table named `{task_name}_{timestamp}` under the configured
    /// folder, access granted to the requesting user, fields initialized.
    /// Any failure here is permanent; nothing has been fetched yet.
    pub async fn provision_destination(
        &self,
        config: &JobConfiguration,
        owner: &SessionId,
    ) -> Result<Destination, StageError> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M");
        let full_name = format!("{}_{stamp}", config.task_name);

        let table = self
            .table
            .create_table(&full_name, config.dest_folder.as_deref())
            .await
            .map_err(|e| StageError::permanent(format!("failed to create destination table: {e}")))?;

        // The table lives in the app's own space; the requester still gets
        // access even if the grant fails.
        if let Err(e) = self.table.grant_access(&table, owner.as_str()).await {
            tracing::warn!(error = %e, "failed to grant destination access");
        }

        self.table
            .init_fields(&table, &config.field_rules)
            .await
            .map_err(|e| StageError::permanent(format!("failed to initialize destination fields: {e}")))?;

        let url = self.table.table_url(&table);
        Ok(Destination { table, url })
    }
}
