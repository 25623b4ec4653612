//! Job orchestrator
//!
//! Owns the life of a job: claims the session's job slot, provisions the
//! destination table, drives the four stages in order with retry and a
//! wall-clock ceiling, and runs the completion unit (purge artifacts,
//! release the slot, send the one terminal notification) on every exit
//! path. `create_job` returns as soon as the driver task is spawned.

use async_trait::async_trait;
use chrono::Utc;
use insight_artifacts::{ArtifactManager, JobStatusProbe};
use insight_common::job::{Job, JobStatus, StageResult, StageStatus};
use insight_common::{InsightError, JobConfiguration, JobId, SessionId, StageKind};
use insight_notify::{Notification, Notifier};
use insight_pipeline::{PipelineDeps, StageContext, StagePayload};
use insight_session::SessionStore;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Retry and timeout policy for job execution.
#[derive(Debug, Clone)]
pub struct JobPolicy {
    /// Attempt ceiling per stage, including the first attempt
    pub max_attempts: u32,
    /// First retry delay; doubles per retry
    pub backoff_base: Duration,
    /// Wall-clock ceiling for the whole stage loop
    pub job_timeout: Duration,
    /// Per-job work directories are created beneath this root
    pub work_root: PathBuf,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            job_timeout: Duration::from_secs(30 * 60),
            work_root: std::env::temp_dir().join("video-insight"),
        }
    }
}

#[derive(Clone)]
struct JobEntry {
    record: Job,
    cancel: Arc<AtomicBool>,
}

/// Terminal jobs kept queryable after leaving the live registry.
const RECENT_TERMINAL_CAP: usize = 64;

/// Drives jobs through the pipeline. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct JobOrchestrator {
    sessions: SessionStore,
    artifacts: ArtifactManager,
    notifier: Arc<dyn Notifier>,
    deps: PipelineDeps,
    policy: Arc<JobPolicy>,
    /// Jobs still running. Entries move to `recent` once terminal.
    jobs: Arc<RwLock<HashMap<JobId, JobEntry>>>,
    recent: Arc<RwLock<VecDeque<Job>>>,
}

impl JobOrchestrator {
    #[must_use]
    pub fn new(
        sessions: SessionStore,
        artifacts: ArtifactManager,
        notifier: Arc<dyn Notifier>,
        deps: PipelineDeps,
        policy: JobPolicy,
    ) -> Self {
        Self {
            sessions,
            artifacts,
            notifier,
            deps,
            policy: Arc::new(policy),
            jobs: Arc::new(RwLock::new(HashMap::with_capacity(16))),
            recent: Arc::new(RwLock::new(VecDeque::with_capacity(RECENT_TERMINAL_CAP))),
        }
    }

    /// Claim the session's job slot and start the pipeline in the
    /// background. Exactly one of any set of concurrent calls for the same
    /// session wins; the rest fail with `SessionBusy` and change nothing.
    pub async fn create_job(
        &self,
        session_id: SessionId,
        config: JobConfiguration,
    ) -> insight_common::Result<JobId> {
        let job = Job::new(session_id.clone(), config);
        let job_id = job.id;

        self.sessions.acquire_job_slot(&session_id, job_id).await?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.jobs.write().await.insert(
            job_id,
            JobEntry {
                record: job,
                cancel,
            },
        );
        info!(job = %job_id, session = %session_id, "job created");

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(job_id).await;
        });
        Ok(job_id)
    }

    /// Request cancellation. Takes effect at the next stage boundary;
    /// cleanup and the terminal notification still run. Returns `false`
    /// for unknown or already-terminal jobs.
    pub async fn cancel_job(&self, job_id: JobId) -> bool {
        let jobs = self.jobs.read().await;
        match jobs.get(&job_id) {
            Some(entry) if !entry.record.is_terminal() => {
                entry.cancel.store(true, Ordering::Relaxed);
                info!(job = %job_id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of a job's record, live or recently terminal.
    pub async fn get_job(&self, job_id: JobId) -> Option<Job> {
        if let Some(entry) = self.jobs.read().await.get(&job_id) {
            return Some(entry.record.clone());
        }
        self.recent
            .read()
            .await
            .iter()
            .rev()
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Number of jobs still in the live registry.
    pub async fn live_jobs(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn store(&self, job: &Job) {
        if let Some(entry) = self.jobs.write().await.get_mut(&job.id) {
            entry.record = job.clone();
        }
    }

    async fn run_job(&self, job_id: JobId) {
        let Some(entry) = self.jobs.read().await.get(&job_id).cloned() else {
            warn!(job = %job_id, "driver started for unknown job");
            return;
        };
        let mut job = entry.record;
        let cancel = entry.cancel;
        let session_id = job.session_id.clone();
        let config = Arc::new(job.config.clone());

        self.notifier
            .notify(
                &session_id,
                Notification::Accepted {
                    job_id,
                    task_name: config.task_name.clone(),
                },
            )
            .await;

        job.status = JobStatus::Running;
        self.store(&job).await;

        let work_dir = self.policy.work_root.join(job_id.to_string());
        let mut destination_url = None;

        match self.prepare(&mut job, &config, &session_id, &work_dir).await {
            Err(()) => {}
            Ok(mut payload) => {
                let ceiling = self.policy.job_timeout;
                let driven = tokio::time::timeout(
                    ceiling,
                    self.drive_stages(
                        &mut job,
                        &mut payload,
                        &session_id,
                        config.clone(),
                        cancel.clone(),
                        &work_dir,
                    ),
                )
                .await;

                if driven.is_err() {
                    let reason = InsightError::Timeout(ceiling.as_secs()).to_string();
                    warn!(job = %job_id, "{reason}");
                    // The interrupted stage never recorded a result.
                    if let Some(kind) = StageKind::SEQUENCE
                        .iter()
                        .copied()
                        .find(|k| job.stage(*k).is_none())
                    {
                        let mut result = StageResult::started(kind);
                        result.status = StageStatus::Failed;
                        result.error = Some(reason.clone());
                        result.finished_at = Some(Utc::now());
                        job.stages.push(result);
                        self.notifier
                            .notify(
                                &session_id,
                                Notification::StageFailed {
                                    kind,
                                    error: reason,
                                },
                            )
                            .await;
                    }
                    skip_remaining(&mut job);
                    job.status = JobStatus::Failed;
                }
                destination_url = payload.destination.map(|d| d.url);
            }
        }

        self.finish(job, destination_url).await;
    }

    /// Create the job work tree and provision the destination table.
    /// Failure is permanent and recorded against the first stage.
    async fn prepare(
        &self,
        job: &mut Job,
        config: &Arc<JobConfiguration>,
        session_id: &SessionId,
        work_dir: &PathBuf,
    ) -> Result<StagePayload, ()> {
        let setup = async {
            tokio::fs::create_dir_all(work_dir)
                .await
                .map_err(|e| format!("cannot create work dir: {e}"))?;
            // The whole work tree is one artifact, so purging the job
            // removes every fetched and derived file in one sweep.
            self.artifacts.register(job.id, work_dir).await;

            self.deps
                .provision_destination(config, session_id)
                .await
                .map_err(|e| e.to_string())
        }
        .await;

        match setup {
            Ok(destination) => Ok(StagePayload {
                destination: Some(destination),
                items: Vec::new(),
            }),
            Err(reason) => {
                let mut result = StageResult::started(StageKind::Acquire);
                result.status = StageStatus::Failed;
                result.error = Some(reason);
                result.finished_at = Some(Utc::now());
                job.stages.push(result);
                skip_remaining(job);
                job.status = JobStatus::Failed;
                Err(())
            }
        }
    }

    async fn drive_stages(
        &self,
        job: &mut Job,
        payload: &mut StagePayload,
        session_id: &SessionId,
        config: Arc<JobConfiguration>,
        cancel: Arc<AtomicBool>,
        work_dir: &PathBuf,
    ) {
        for stage in self.deps.stages() {
            let kind = stage.kind();

            if cancel.load(Ordering::Relaxed) {
                info!(job = %job.id, "cancelled at stage boundary");
                skip_remaining(job);
                job.status = JobStatus::Cancelled;
                return;
            }

            self.notifier
                .notify(session_id, Notification::StageStarted { kind })
                .await;
            let mut result = StageResult::started(kind);

            loop {
                let ctx = StageContext {
                    job_id: job.id,
                    session_id: session_id.clone(),
                    config: config.clone(),
                    artifacts: self.artifacts.clone(),
                    work_dir: work_dir.clone(),
                    cancelled: cancel.clone(),
                    payload: payload.clone(),
                };

                match stage.run(&ctx).await {
                    Ok(output) => {
                        result.status = StageStatus::Succeeded;
                        result.items = output.items;
                        result.artifacts = output.artifacts;
                        result.finished_at = Some(Utc::now());
                        *payload = output.payload;
                        break;
                    }
                    Err(e) if e.is_transient() && result.attempts < self.policy.max_attempts => {
                        let delay = self.policy.backoff_base * (1u32 << (result.attempts - 1));
                        warn!(
                            job = %job.id, stage = %kind, attempt = result.attempts,
                            error = %e, delay_ms = delay.as_millis() as u64,
                            "stage attempt failed, retrying"
                        );
                        result.attempts += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        let e = e.into_permanent();
                        let wrapped = InsightError::Stage {
                            stage: kind,
                            source: e,
                        };
                        warn!(job = %job.id, "{wrapped}");
                        let reason = wrapped.to_string();
                        result.status = StageStatus::Failed;
                        result.error = Some(reason.clone());
                        result.finished_at = Some(Utc::now());
                        job.stages.push(result);
                        skip_remaining(job);
                        job.status = JobStatus::Failed;
                        self.notifier
                            .notify(
                                session_id,
                                Notification::StageFailed {
                                    kind,
                                    error: reason,
                                },
                            )
                            .await;
                        return;
                    }
                }
            }

            let counts = result.items;
            job.stages.push(result);
            self.store(job).await;
            self.notifier
                .notify(
                    session_id,
                    Notification::StageFinished {
                        kind,
                        ok: counts.ok,
                        failed: counts.failed,
                    },
                )
                .await;
        }

        job.status = JobStatus::Succeeded;
    }

    /// The completion unit, run on every terminal path. Purge failures are
    /// logged inside the artifact manager and never keep the slot held.
    async fn finish(&self, mut job: Job, destination_url: Option<String>) {
        job.completed_at = Some(Utc::now());

        let disposed = self.artifacts.purge_job(job.id).await;
        debug!(job = %job.id, disposed, "job artifacts purged");

        self.sessions.release_job_slot(&job.session_id, job.id).await;

        // The live registry only holds running jobs; a bounded window of
        // recent terminal ones stays queryable for status lookups.
        self.jobs.write().await.remove(&job.id);
        {
            let mut recent = self.recent.write().await;
            recent.push_back(job.clone());
            while recent.len() > RECENT_TERMINAL_CAP {
                recent.pop_front();
            }
        }

        let summary = job.summary(destination_url);
        info!(job = %job.id, status = ?job.status, "job finished");
        self.notifier
            .notify(&job.session_id, Notification::Terminal(summary))
            .await;
    }
}

/// The sweeper asks before reaping; only artifacts of gone or terminal
/// jobs are fair game.
#[async_trait]
impl JobStatusProbe for JobOrchestrator {
    async fn is_job_active(&self, job_id: JobId) -> bool {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|e| !e.record.is_terminal())
            .unwrap_or(false)
    }
}

fn skip_remaining(job: &mut Job) {
    for kind in StageKind::SEQUENCE {
        if job.stage(kind).is_none() {
            job.stages.push(StageResult::skipped(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insight_common::{FieldRule, StageError, TableRef};
    use insight_notify::MemoryNotifier;
    use insight_pipeline::{
        AnalysisClient, AnalysisRequest, AnalysisRow, ExtractedSignals, MediaFetcher, ResultRow,
        SignalExtractor, SourceRow, TableStore, Transcriber,
    };
    use serde_json::{json, Map};
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex;

    struct FakeTable {
        rows: Vec<SourceRow>,
        list_transient_failures: AtomicU32,
        fail_create: bool,
        upserts: Mutex<Vec<Vec<ResultRow>>>,
    }

    impl FakeTable {
        fn with_items(names: &[&str]) -> Self {
            let rows = names
                .iter()
                .map(|name| SourceRow {
                    record_id: format!("rec_{name}"),
                    fields: json!({
                        "素材名称": name,
                        "视频链接": format!("https://cdn/{name}.mp4"),
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                })
                .collect();
            Self {
                rows,
                list_transient_failures: AtomicU32::new(0),
                fail_create: false,
                upserts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TableStore for FakeTable {
        async fn list_rows(&self, _table: &TableRef) -> Result<Vec<SourceRow>, StageError> {
            if self.list_transient_failures.load(Ordering::SeqCst) > 0 {
                self.list_transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StageError::transient("table api unreachable".to_string()));
            }
            Ok(self.rows.clone())
        }

        async fn create_table(
            &self,
            _name: &str,
            _folder: Option<&str>,
        ) -> Result<TableRef, StageError> {
            if self.fail_create {
                return Err(StageError::permanent("folder not writable".to_string()));
            }
            Ok(TableRef {
                app_token: "bascnDest".to_string(),
                table_id: Some("tblDest".to_string()),
                wiki: false,
            })
        }

        async fn grant_access(&self, _table: &TableRef, _member: &str) -> Result<(), StageError> {
            Ok(())
        }

        async fn init_fields(
            &self,
            _table: &TableRef,
            _rules: &[FieldRule],
        ) -> Result<(), StageError> {
            Ok(())
        }

        async fn upsert_rows(&self, _table: &TableRef, rows: &[ResultRow]) -> Result<(), StageError> {
            self.upserts.lock().await.push(rows.to_vec());
            Ok(())
        }

        fn table_url(&self, table: &TableRef) -> String {
            table.url("https://example.test")
        }
    }

    struct FakeFetcher {
        fail_urls: Vec<String>,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<(), StageError> {
            if self.fail_urls.iter().any(|f| f == url) {
                return Err(StageError::transient("connection reset".to_string()));
            }
            tokio::fs::write(dest, b"media")
                .await
                .map_err(|e| StageError::transient(e.to_string()))
        }
    }

    struct FakeExtractor {
        delay: Duration,
    }

    #[async_trait]
    impl SignalExtractor for FakeExtractor {
        async fn extract(
            &self,
            _media: &Path,
            out_dir: &Path,
        ) -> Result<ExtractedSignals, StageError> {
            tokio::time::sleep(self.delay).await;
            tokio::fs::create_dir_all(out_dir)
                .await
                .map_err(|e| StageError::transient(e.to_string()))?;
            let audio = out_dir.join("audio.wav");
            let frame_sheet = out_dir.join("frame_sheet.jpg");
            tokio::fs::write(&audio, b"wav")
                .await
                .map_err(|e| StageError::transient(e.to_string()))?;
            tokio::fs::write(&frame_sheet, b"jpg")
                .await
                .map_err(|e| StageError::transient(e.to_string()))?;
            Ok(ExtractedSignals { audio, frame_sheet })
        }
    }

    struct FakeTranscriber;

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, _audio: &Path) -> Result<Option<String>, StageError> {
            Ok(None)
        }
    }

    struct FakeAnalyzer;

    #[async_trait]
    impl AnalysisClient for FakeAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<AnalysisRow, StageError> {
            let mut row = Map::new();
            row.insert("概述".to_string(), json!(format!("summary of {}", request.name)));
            Ok(row)
        }
    }

    struct Harness {
        orchestrator: JobOrchestrator,
        notifier: MemoryNotifier,
        table: Arc<FakeTable>,
        _work_root: tempfile::TempDir,
    }

    fn harness_with(table: FakeTable, fail_urls: Vec<String>, policy: Option<JobPolicy>) -> Harness {
        let work_root = tempfile::tempdir().unwrap();
        let table = Arc::new(table);
        let deps = PipelineDeps {
            table: table.clone(),
            fetcher: Arc::new(FakeFetcher { fail_urls }),
            extractor: Arc::new(FakeExtractor {
                delay: Duration::ZERO,
            }),
            transcriber: Arc::new(FakeTranscriber),
            analyzer: Arc::new(FakeAnalyzer),
        };
        let notifier = MemoryNotifier::new();
        let policy = policy.unwrap_or(JobPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            job_timeout: Duration::from_secs(30),
            work_root: work_root.path().to_path_buf(),
        });
        let orchestrator = JobOrchestrator::new(
            SessionStore::new(),
            ArtifactManager::new(),
            Arc::new(notifier.clone()),
            deps,
            policy,
        );
        Harness {
            orchestrator,
            notifier,
            table,
            _work_root: work_root,
        }
    }

    fn test_config() -> JobConfiguration {
        JobConfiguration {
            source: TableRef {
                app_token: "bascnSrc".to_string(),
                table_id: Some("tblSrc".to_string()),
                wiki: false,
            },
            task_name: "ads-review".to_string(),
            dest_folder: None,
            field_rules: Vec::new(),
        }
    }

    async fn wait_terminal(orchestrator: &JobOrchestrator, job_id: JobId) -> Job {
        for _ in 0..500 {
            if let Some(job) = orchestrator.get_job(job_id).await {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal status");
    }

    #[tokio::test]
    async fn test_successful_job_runs_stages_in_order() {
        let h = harness_with(FakeTable::with_items(&["a", "b"]), Vec::new(), None);
        let sid = SessionId::from("ou_1");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Succeeded);
        let kinds: Vec<StageKind> = job.stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StageKind::SEQUENCE.to_vec());
        assert!(job
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Succeeded));

        let sent = h.notifier.sent_to(&sid).await;
        assert!(matches!(sent.first(), Some(Notification::Accepted { .. })));
        match sent.last() {
            Some(Notification::Terminal(summary)) => {
                assert_eq!(summary.status, JobStatus::Succeeded);
                assert_eq!(summary.items.ok, 2);
                assert!(summary.destination.as_deref().unwrap().contains("bascnDest"));
            }
            other => panic!("expected terminal notification, got {other:?}"),
        }
        // Exactly one terminal notification.
        let terminals = sent
            .iter()
            .filter(|n| matches!(n, Notification::Terminal(_)))
            .count();
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn test_partial_acquire_failure_still_succeeds() {
        let h = harness_with(
            FakeTable::with_items(&["a", "b", "c"]),
            vec!["https://cdn/c.mp4".to_string()],
            None,
        );
        let sid = SessionId::from("ou_2");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Succeeded);
        let counts = job.item_counts();
        assert_eq!(counts.ok, 2);
        assert_eq!(counts.failed, 1);

        let upserts = h.table.upserts.lock().await;
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].len(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_to_success() {
        let table = FakeTable::with_items(&["a"]);
        table.list_transient_failures.store(2, Ordering::SeqCst);
        let h = harness_with(table, Vec::new(), None);
        let job_id = h
            .orchestrator
            .create_job(SessionId::from("ou_3"), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Succeeded);
        let acquire = job.stage(StageKind::Acquire).unwrap();
        assert_eq!(acquire.attempts, 3);
        assert_eq!(acquire.status, StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_job() {
        let table = FakeTable::with_items(&["a"]);
        table.list_transient_failures.store(10, Ordering::SeqCst);
        let h = harness_with(table, Vec::new(), None);
        let sid = SessionId::from("ou_4");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        let acquire = job.stage(StageKind::Acquire).unwrap();
        assert_eq!(acquire.status, StageStatus::Failed);
        assert!(acquire.error.as_deref().unwrap().contains("retries exhausted"));
        assert!(job
            .stages
            .iter()
            .skip(1)
            .all(|s| s.status == StageStatus::Skipped));

        // Slot released on failure; the session accepts a new job.
        assert!(h
            .orchestrator
            .create_job(sid, test_config())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_purges_artifacts() {
        let work_root = tempfile::tempdir().unwrap();
        let table = Arc::new(FakeTable::with_items(&["a"]));
        let deps = PipelineDeps {
            table: table.clone(),
            fetcher: Arc::new(FakeFetcher { fail_urls: Vec::new() }),
            extractor: Arc::new(FakeExtractor {
                delay: Duration::from_secs(60),
            }),
            transcriber: Arc::new(FakeTranscriber),
            analyzer: Arc::new(FakeAnalyzer),
        };
        let notifier = MemoryNotifier::new();
        let artifacts = ArtifactManager::new();
        let orchestrator = JobOrchestrator::new(
            SessionStore::new(),
            artifacts.clone(),
            Arc::new(notifier.clone()),
            deps,
            JobPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                job_timeout: Duration::from_millis(300),
                work_root: work_root.path().to_path_buf(),
            },
        );

        let sid = SessionId::from("ou_5");
        let job_id = orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        let extract = job.stage(StageKind::Extract).unwrap();
        assert_eq!(extract.status, StageStatus::Failed);
        assert!(extract.error.as_deref().unwrap().contains("wall-clock"));

        assert!(artifacts.live_artifacts(job_id).await.is_empty());
        assert!(!work_root.path().join(job_id.to_string()).exists());

        // The interrupted stage reports its failure before the terminal
        // summary.
        let sent = notifier.sent_to(&sid).await;
        let failed_at = sent
            .iter()
            .position(|n| {
                matches!(
                    n,
                    Notification::StageFailed {
                        kind: StageKind::Extract,
                        ..
                    }
                )
            })
            .expect("stage failure notified");
        let terminal_at = sent
            .iter()
            .position(|n| matches!(n, Notification::Terminal(_)))
            .unwrap();
        assert!(failed_at < terminal_at);
    }

    #[tokio::test]
    async fn test_permanent_stage_failure_is_notified() {
        // An empty source table fails acquire without any retry.
        let h = harness_with(FakeTable::with_items(&[]), Vec::new(), None);
        let sid = SessionId::from("ou_fail");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let sent = h.notifier.sent_to(&sid).await;
        let failed_at = sent
            .iter()
            .position(|n| {
                matches!(
                    n,
                    Notification::StageFailed {
                        kind: StageKind::Acquire,
                        ..
                    }
                )
            })
            .expect("stage failure notified");
        let terminal_at = sent
            .iter()
            .position(|n| matches!(n, Notification::Terminal(_)))
            .unwrap();
        assert!(failed_at < terminal_at);
        match &sent[failed_at] {
            Notification::StageFailed { error, .. } => {
                assert!(error.contains("no usable media links"));
            }
            other => panic!("expected stage failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_jobs_leave_live_registry() {
        let h = harness_with(FakeTable::with_items(&["a"]), Vec::new(), None);
        let sid = SessionId::from("ou_done");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded);

        // Terminal jobs are evicted; the record stays queryable through
        // the recent-terminal window.
        assert_eq!(h.orchestrator.live_jobs().await, 0);
        let archived = h.orchestrator.get_job(job_id).await.unwrap();
        assert!(archived.is_terminal());
        assert!(!h.orchestrator.cancel_job(job_id).await);
    }

    #[tokio::test]
    async fn test_cancel_reaches_terminal_and_releases_slot() {
        let table = FakeTable::with_items(&["a"]);
        table.list_transient_failures.store(1, Ordering::SeqCst);
        let h = harness_with(table, Vec::new(), None);
        let sid = SessionId::from("ou_6");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        assert!(h.orchestrator.cancel_job(job_id).await);

        let job = wait_terminal(&h.orchestrator, job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job
            .stages
            .iter()
            .filter(|s| s.status != StageStatus::Succeeded)
            .all(|s| s.status == StageStatus::Skipped));

        let session = h.orchestrator.sessions.get(&sid).await.unwrap();
        assert!(session.active_job.is_none());
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_permanent() {
        let mut table = FakeTable::with_items(&["a"]);
        table.fail_create = true;
        let h = harness_with(table, Vec::new(), None);
        let sid = SessionId::from("ou_7");
        let job_id = h
            .orchestrator
            .create_job(sid.clone(), test_config())
            .await
            .unwrap();
        let job = wait_terminal(&h.orchestrator, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        let acquire = job.stage(StageKind::Acquire).unwrap();
        assert_eq!(acquire.status, StageStatus::Failed);
        assert!(acquire
            .error
            .as_deref()
            .unwrap()
            .contains("destination table"));
    }

    #[tokio::test]
    async fn test_concurrent_create_job_single_winner() {
        let h = harness_with(FakeTable::with_items(&["a"]), Vec::new(), None);
        let sid = SessionId::from("ou_race");

        let attempts = (0..8).map(|_| {
            let orchestrator = h.orchestrator.clone();
            let sid = sid.clone();
            tokio::spawn(async move { orchestrator.create_job(sid, test_config()).await })
        });
        let results = futures_join(attempts).await;

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for loser in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(
                loser.as_ref().unwrap_err(),
                InsightError::SessionBusy(_)
            ));
        }
    }

    async fn futures_join(
        handles: impl Iterator<Item = tokio::task::JoinHandle<insight_common::Result<JobId>>>,
    ) -> Vec<insight_common::Result<JobId>> {
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.expect("task panicked"));
        }
        results
    }

    #[tokio::test]
    async fn test_probe_reports_activity() {
        let table = FakeTable::with_items(&["a"]);
        table.list_transient_failures.store(3, Ordering::SeqCst);
        let h = harness_with(table, Vec::new(), None);
        let job_id = h
            .orchestrator
            .create_job(SessionId::from("ou_8"), test_config())
            .await
            .unwrap();

        assert!(h.orchestrator.is_job_active(job_id).await);
        wait_terminal(&h.orchestrator, job_id).await;
        assert!(!h.orchestrator.is_job_active(job_id).await);
        assert!(!h.orchestrator.is_job_active(JobId::new()).await);
    }
}
