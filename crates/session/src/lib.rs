//! Per-session conversation state
//!
//! Tracks the dialogue phase of every chat context and owns the one
//! resource in the system that needs mutual exclusion: the per-session job
//! slot. Transition logic lives here; message formatting lives in the
//! notifier.
//!
//! Phases: `Idle -> AwaitingConfig -> Confirmed -> Busy -> Idle`.

use insight_common::{
    InsightError, JobConfiguration, JobId, PendingConfig, SessionId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Dialogue phase of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialoguePhase {
    /// Nothing in flight
    Idle,
    /// Configuration card sent, collecting fields
    AwaitingConfig,
    /// Configuration validated, waiting for the orchestrator to accept
    Confirmed,
    /// A job holds this session's slot
    Busy,
}

/// State of one chat conversation. Created on first event, never destroyed.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub phase: DialoguePhase,
    pub pending: PendingConfig,
    /// Back-pointer to the active job; at most one, cleared exactly once
    /// when that job reaches a terminal status.
    pub active_job: Option<JobId>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            phase: DialoguePhase::Idle,
            pending: PendingConfig::default(),
            active_job: None,
        }
    }
}

/// Semantic reply produced by a transition. The server forwards these to
/// the notifier; no message text is built here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReply {
    /// Send the configuration card
    ConfigPrompt,
    /// Point the user at the trigger keywords
    UsageHint,
    /// Liveness answer to "ping"
    Pong,
    /// Submit rejected, stay in `AwaitingConfig`
    ValidationFeedback(String),
    /// A job already holds the slot
    SessionBusy,
    /// Nothing to say
    Silent,
}

/// Outcome of a card submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Configuration frozen; hand it to the orchestrator
    Launch(JobConfiguration),
    Reply(SessionReply),
}

/// Trigger keywords that open the configuration card.
const TRIGGER_KEYWORDS: [&str; 5] = ["分析", "start", "menu", "开始", "菜单"];

/// Shared store of all sessions.
///
/// A single mutex over the map keeps slot acquisition atomic with phase
/// transitions; every access path mutates, so a `RwLock` buys nothing here.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::with_capacity(64))),
        }
    }

    /// Handle a plain text message.
    pub async fn on_message(&self, session_id: &SessionId, text: &str) -> SessionReply {
        let mut sessions = self.sessions.lock().await;
        let session = entry(&mut sessions, session_id);
        let lowered = text.to_lowercase();

        if lowered == "ping" {
            return SessionReply::Pong;
        }

        if TRIGGER_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            match session.phase {
                DialoguePhase::Busy | DialoguePhase::Confirmed => {
                    debug!(session = %session_id, "trigger while job active");
                    return SessionReply::SessionBusy;
                }
                _ => {
                    session.phase = DialoguePhase::AwaitingConfig;
                    session.pending = PendingConfig::default();
                    info!(session = %session_id, "opened configuration dialogue");
                    return SessionReply::ConfigPrompt;
                }
            }
        }

        // While a job runs, stray chatter gets no reply.
        if matches!(session.phase, DialoguePhase::Busy | DialoguePhase::Confirmed) {
            return SessionReply::Silent;
        }

        if text.is_empty() {
            SessionReply::Silent
        } else {
            SessionReply::UsageHint
        }
    }

    /// Handle a single card field edit; stays in `AwaitingConfig`.
    pub async fn on_card_edit(
        &self,
        session_id: &SessionId,
        field: &str,
        value: &str,
    ) -> SessionReply {
        let mut sessions = self.sessions.lock().await;
        let session = entry(&mut sessions, session_id);
        if session.phase != DialoguePhase::AwaitingConfig {
            debug!(session = %session_id, field, "card edit outside config dialogue");
            return SessionReply::Silent;
        }
        session.pending.set_field(field, value);
        SessionReply::Silent
    }

    /// Handle a card form submit.
    ///
    /// Submits are accepted from `Idle` as well as `AwaitingConfig`: cards
    /// outlive a server restart, and the form carries everything needed.
    /// Duplicate submissions collapse upstream in the dedup cache, so a
    /// single delivery reaching this point means a single launch attempt.
    pub async fn on_card_submit(
        &self,
        session_id: &SessionId,
        form: &HashMap<String, String>,
    ) -> SubmitOutcome {
        let mut sessions = self.sessions.lock().await;
        let session = entry(&mut sessions, session_id);

        if matches!(session.phase, DialoguePhase::Busy | DialoguePhase::Confirmed) {
            info!(session = %session_id, "submit rejected, session busy");
            return SubmitOutcome::Reply(SessionReply::SessionBusy);
        }

        for (field, value) in form {
            session.pending.set_field(field, value);
        }

        match session.pending.build() {
            Ok(config) => {
                session.phase = DialoguePhase::Confirmed;
                info!(session = %session_id, task = %config.task_name, "configuration confirmed");
                SubmitOutcome::Launch(config)
            }
            Err(e) => {
                debug!(session = %session_id, error = %e, "submit failed validation");
                SubmitOutcome::Reply(SessionReply::ValidationFeedback(e.to_string()))
            }
        }
    }

    /// Atomically claim the session's job slot for `job_id`.
    ///
    /// Fails with `SessionBusy` when another non-terminal job holds the
    /// slot; the losing caller must not mutate anything else.
    pub async fn acquire_job_slot(
        &self,
        session_id: &SessionId,
        job_id: JobId,
    ) -> Result<(), InsightError> {
        let mut sessions = self.sessions.lock().await;
        let session = entry(&mut sessions, session_id);

        if session.active_job.is_some() {
            return Err(InsightError::SessionBusy(session_id.clone()));
        }

        session.active_job = Some(job_id);
        session.phase = DialoguePhase::Busy;
        info!(session = %session_id, job = %job_id, "job slot acquired");
        Ok(())
    }

    /// Release the slot when `job_id` reaches a terminal status.
    ///
    /// Clears the back-pointer exactly once; a release for a job that no
    /// longer holds the slot is a logged no-op, never an error.
    pub async fn release_job_slot(&self, session_id: &SessionId, job_id: JobId) {
        let mut sessions = self.sessions.lock().await;
        let session = entry(&mut sessions, session_id);

        if session.active_job == Some(job_id) {
            session.active_job = None;
            session.phase = DialoguePhase::Idle;
            session.pending = PendingConfig::default();
            info!(session = %session_id, job = %job_id, "job slot released");
        } else {
            warn!(session = %session_id, job = %job_id, "release for job not holding the slot");
        }
    }

    /// Roll a `Confirmed` session back to `Idle` when the orchestrator
    /// refused the job (slot race lost to a concurrent submit).
    pub async fn abort_confirmation(&self, session_id: &SessionId) {
        let mut sessions = self.sessions.lock().await;
        let session = entry(&mut sessions, session_id);
        if session.phase == DialoguePhase::Confirmed {
            session.phase = DialoguePhase::Idle;
        }
    }

    /// Snapshot of one session, for handlers and tests.
    pub async fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}

fn entry<'a>(
    sessions: &'a mut HashMap<SessionId, Session>,
    session_id: &SessionId,
) -> &'a mut Session {
    sessions
        .entry(session_id.clone())
        .or_insert_with(|| Session::new(session_id.clone()))
}
