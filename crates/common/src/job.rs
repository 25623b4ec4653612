//! Job and stage data model
//!
//! A `Job` is one run of the fixed four-stage pipeline. Stage results are
//! appended strictly in pipeline order; a result list is always a prefix of
//! [`StageKind::SEQUENCE`].

use crate::{config::JobConfiguration, ArtifactId, JobId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Fetch source media items into local artifacts
    Acquire,
    /// Derive audio track and frame sheet per item
    Extract,
    /// Invoke the multimodal analysis collaborator per item
    Analyze,
    /// Upsert analysis rows into the destination table
    Persist,
}

impl StageKind {
    /// Pipeline execution order. Stages never run out of this sequence.
    pub const SEQUENCE: [StageKind; 4] = [
        StageKind::Acquire,
        StageKind::Extract,
        StageKind::Analyze,
        StageKind::Persist,
    ];

    /// Human-readable stage name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Extract => "extract",
            Self::Analyze => "analyze",
            Self::Persist => "persist",
        }
    }

    /// Position in the pipeline, starting at 1 (for progress messages).
    #[must_use]
    pub fn position(&self) -> usize {
        Self::SEQUENCE.iter().position(|s| s == self).unwrap_or(0) + 1
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Overall status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Status of a single stage within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Per-item outcome counts for a stage or a whole job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub ok: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ItemCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.ok + self.failed + self.skipped
    }

    pub fn absorb(&mut self, other: ItemCounts) {
        self.ok += other.ok;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Outcome of one stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub kind: StageKind,
    pub status: StageStatus,
    /// Number of attempts made, including the successful one
    pub attempts: u32,
    pub error: Option<String>,
    /// Artifacts registered while this stage ran
    pub artifacts: Vec<ArtifactId>,
    pub items: ItemCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    #[must_use]
    pub fn started(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Running,
            attempts: 1,
            error: None,
            artifacts: Vec::new(),
            items: ItemCounts::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[must_use]
    pub fn skipped(kind: StageKind) -> Self {
        let now = Utc::now();
        Self {
            kind,
            status: StageStatus::Skipped,
            attempts: 0,
            error: None,
            artifacts: Vec::new(),
            items: ItemCounts::default(),
            started_at: now,
            finished_at: Some(now),
        }
    }
}

/// One pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub session_id: SessionId,
    pub config: JobConfiguration,
    pub stages: Vec<StageResult>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    #[must_use]
    pub fn new(session_id: SessionId, config: JobConfiguration) -> Self {
        Self {
            id: JobId::new(),
            session_id,
            config,
            stages: Vec::with_capacity(StageKind::SEQUENCE.len()),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Result of the named stage, if it has started.
    #[must_use]
    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// Aggregate item counts across all stages that track items.
    ///
    /// Acquire's counts describe the batch; later stages only shrink the ok
    /// set, so the summary uses the last stage that recorded any items.
    #[must_use]
    pub fn item_counts(&self) -> ItemCounts {
        self.stages
            .iter()
            .rev()
            .map(|s| s.items)
            .find(|c| c.total() > 0)
            .unwrap_or_default()
    }

    /// Build the payload for the single terminal notification.
    #[must_use]
    pub fn summary(&self, destination: Option<String>) -> JobSummary {
        let failed_stage = self
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
            .map(|s| s.kind);
        let error = self
            .stages
            .iter()
            .find_map(|s| s.error.clone());
        let elapsed_secs = self
            .completed_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(self.created_at)
            .num_seconds()
            .max(0) as u64;

        JobSummary {
            job_id: self.id,
            task_name: self.config.task_name.clone(),
            status: self.status,
            items: self.item_counts(),
            failed_stage,
            error,
            destination,
            elapsed_secs,
        }
    }
}

/// Terminal summary of a job, rendered into the final chat notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub task_name: String,
    pub status: JobStatus,
    pub items: ItemCounts,
    pub failed_stage: Option<StageKind>,
    pub error: Option<String>,
    /// Link to the destination table, when provisioning got that far
    pub destination: Option<String>,
    pub elapsed_secs: u64,
}
