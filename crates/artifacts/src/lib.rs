//! Artifact lifecycle management
//!
//! Every transient file a stage creates is registered here before the stage
//! returns, which makes cleanup independent of stage success. Disposal runs
//! through three paths, in order of preference:
//!
//! 1. the orchestrator's completion unit (`purge_job` on every terminal
//!    status),
//! 2. the periodic orphan sweep (crash net for jobs whose completion unit
//!    never ran),
//! 3. a retry of failed disposals on the next sweep.
//!
//! Disposal failures are logged, never escalated; they must not re-open a
//! job or block a session.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use insight_common::{ArtifactId, JobId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One registered transient resource
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
    pub disposed: bool,
}

/// Answers whether a job may still be producing or reading artifacts.
///
/// The sweeper only reaps artifacts whose owning job is terminal or
/// unknown; the orchestrator implements this over its job registry.
#[async_trait]
pub trait JobStatusProbe: Send + Sync {
    async fn is_job_active(&self, job_id: JobId) -> bool;
}

/// Probe that treats every job as inactive. For tests and standalone use.
pub struct NoActiveJobs;

#[async_trait]
impl JobStatusProbe for NoActiveJobs {
    async fn is_job_active(&self, _job_id: JobId) -> bool {
        false
    }
}

/// Registry of transient artifacts with guaranteed-deletion semantics.
#[derive(Clone, Default)]
pub struct ArtifactManager {
    records: Arc<Mutex<HashMap<ArtifactId, ArtifactRecord>>>,
}

impl ArtifactManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::with_capacity(128))),
        }
    }

    /// Register a resource created for `job_id`. Must be called before the
    /// creating stage returns.
    pub async fn register(&self, job_id: JobId, location: impl AsRef<Path>) -> ArtifactId {
        let record = ArtifactRecord {
            id: ArtifactId::new(),
            job_id,
            location: location.as_ref().to_path_buf(),
            created_at: Utc::now(),
            disposed: false,
        };
        let id = record.id;
        debug!(job = %job_id, artifact = %id, path = %record.location.display(), "artifact registered");
        self.records.lock().await.insert(id, record);
        id
    }

    /// Dispose a single artifact. Missing files count as disposed (another
    /// path already cleaned them up); removal errors leave the record
    /// undisposed for the next sweep.
    pub async fn dispose(&self, artifact_id: ArtifactId) -> bool {
        let record = {
            let records = self.records.lock().await;
            records.get(&artifact_id).cloned()
        };
        let Some(record) = record else {
            warn!(artifact = %artifact_id, "dispose of unknown artifact");
            return true;
        };
        if record.disposed {
            return true;
        }

        let ok = remove_location(&record.location).await;
        if ok {
            let mut records = self.records.lock().await;
            if let Some(r) = records.get_mut(&artifact_id) {
                r.disposed = true;
            }
        }
        ok
    }

    /// Dispose every artifact registered under `job_id`. Returns the number
    /// of artifacts that are now disposed; failures are logged and left for
    /// the sweeper.
    pub async fn purge_job(&self, job_id: JobId) -> usize {
        let ids: Vec<ArtifactId> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|r| r.job_id == job_id && !r.disposed)
                .map(|r| r.id)
                .collect()
        };

        let mut disposed = 0;
        for id in &ids {
            if self.dispose(*id).await {
                disposed += 1;
            }
        }
        if disposed < ids.len() {
            warn!(
                job = %job_id,
                failed = ids.len() - disposed,
                "some artifacts could not be disposed, leaving for sweep"
            );
        } else if !ids.is_empty() {
            info!(job = %job_id, count = disposed, "purged job artifacts");
        }
        disposed
    }

    /// Dispose artifacts older than `older_than` whose owning job is no
    /// longer active, and retry previously failed disposals. Drops fully
    /// disposed records from the registry.
    pub async fn sweep_orphans(&self, older_than: Duration, probe: &dyn JobStatusProbe) -> usize {
        let cutoff = Utc::now() - older_than;
        let candidates: Vec<ArtifactRecord> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|r| !r.disposed && r.created_at < cutoff)
                .cloned()
                .collect()
        };

        let mut swept = 0;
        for record in candidates {
            if probe.is_job_active(record.job_id).await {
                continue;
            }
            if self.dispose(record.id).await {
                swept += 1;
            }
        }

        // Compact: disposed records have nothing left to retry.
        self.records.lock().await.retain(|_, r| !r.disposed);

        if swept > 0 {
            info!(count = swept, "swept orphaned artifacts");
        }
        swept
    }

    /// Undisposed artifacts currently registered for a job (test/diagnostic).
    pub async fn live_artifacts(&self, job_id: JobId) -> Vec<ArtifactRecord> {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.job_id == job_id && !r.disposed)
            .cloned()
            .collect()
    }
}

async fn remove_location(location: &Path) -> bool {
    let metadata = match tokio::fs::metadata(location).await {
        Ok(m) => m,
        // Already gone.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
        Err(e) => {
            warn!(path = %location.display(), error = %e, "failed to stat artifact");
            return false;
        }
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(location).await
    } else {
        tokio::fs::remove_file(location).await
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(path = %location.display(), error = %e, "failed to remove artifact");
            false
        }
    }
}

/// Run the orphan sweep on a fixed interval until the process exits.
pub async fn run_sweeper(
    manager: ArtifactManager,
    probe: Arc<dyn JobStatusProbe>,
    interval: std::time::Duration,
    retention: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The immediate first tick would sweep an empty registry.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        manager.sweep_orphans(retention, probe.as_ref()).await;
    }
}
