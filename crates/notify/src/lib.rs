//! Outbound messaging to the chat platform
//!
//! Notifications are strictly best effort. A send failure is logged and
//! dropped; it never changes job state and never blocks the pipeline.

use async_trait::async_trait;
use insight_common::job::{JobStatus, JobSummary};
use insight_common::{JobId, SessionId, StageKind};
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod card;
pub mod chat;

pub use chat::{ChatConfig, ChatNotifier};

/// Everything the engine ever says to a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Job accepted, pipeline is starting.
    Accepted { job_id: JobId, task_name: String },
    /// A pipeline stage began.
    StageStarted { kind: StageKind },
    /// A pipeline stage ended, with per-item tallies when the stage
    /// processed items.
    StageFinished {
        kind: StageKind,
        ok: usize,
        failed: usize,
    },
    /// A pipeline stage failed for good. The terminal summary follows.
    StageFailed { kind: StageKind, error: String },
    /// Job reached a terminal status. Always the last message for a job.
    Terminal(JobSummary),
    /// Interactive configuration form.
    ConfigPrompt,
    /// Submitted configuration was rejected.
    ValidationFeedback(String),
    /// A job is already running for this conversation.
    Busy,
    /// Unrecognized input, explain how to start.
    UsageHint,
    /// Liveness probe reply.
    Pong,
}

impl Notification {
    /// Plain-text rendering. `ConfigPrompt` has no text form; it renders
    /// as an interactive card via [`card::config_card`].
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Accepted { task_name, .. } => Some(format!(
                "任务已启动！\n名称: {task_name}\n请耐心等待，分析完成后会在这里通知。"
            )),
            Self::StageStarted { kind } => Some(format!(
                "阶段 {}/{} 开始: {}",
                kind.position(),
                StageKind::SEQUENCE.len(),
                kind
            )),
            Self::StageFinished { kind, ok, failed } => {
                if *ok == 0 && *failed == 0 {
                    Some(format!("阶段 {kind} 完成"))
                } else {
                    Some(format!("阶段 {kind} 完成: 成功 {ok}, 失败 {failed}"))
                }
            }
            Self::StageFailed { kind, error } => Some(format!("阶段 {kind} 失败: {error}")),
            Self::Terminal(summary) => Some(render_terminal(summary)),
            Self::ConfigPrompt => None,
            Self::ValidationFeedback(msg) => Some(format!("配置有误: {msg}")),
            Self::Busy => Some("系统忙碌中，请稍后再试（当前有任务正在运行）。".to_string()),
            Self::UsageHint => Some("输入 '分析' 或 'Start' 开启配置面板。".to_string()),
            Self::Pong => Some("pong".to_string()),
        }
    }
}

fn render_terminal(summary: &JobSummary) -> String {
    match summary.status {
        JobStatus::Succeeded => {
            let mut msg = format!(
                "分析完成！\n任务: {}\n成功 {} 项, 失败 {} 项, 跳过 {} 项",
                summary.task_name, summary.items.ok, summary.items.failed, summary.items.skipped
            );
            if let Some(dest) = &summary.destination {
                msg.push_str(&format!("\n结果表格: {dest}"));
            }
            msg
        }
        JobStatus::Cancelled => format!("任务已取消: {}", summary.task_name),
        _ => {
            let reason = summary.error.as_deref().unwrap_or("未知错误");
            let stage = summary
                .failed_stage
                .map(|k| format!("（阶段 {k}）"))
                .unwrap_or_default();
            format!("分析失败{stage}: {reason}")
        }
    }
}

/// Delivery seam. The production implementation talks to the chat
/// platform; tests record in memory.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, session_id: &SessionId, notification: Notification);
}

/// Test double that records every notification in order.
#[derive(Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<(SessionId, Notification)>>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(SessionId, Notification)> {
        self.sent.lock().await.clone()
    }

    /// Notifications delivered to one session, in send order.
    pub async fn sent_to(&self, session_id: &SessionId) -> Vec<Notification> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, session_id: &SessionId, notification: Notification) {
        self.sent
            .lock()
            .await
            .push((session_id.clone(), notification));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insight_common::job::ItemCounts;

    #[test]
    fn test_terminal_success_mentions_destination() {
        let summary = JobSummary {
            job_id: JobId::new(),
            task_name: "demo".to_string(),
            status: JobStatus::Succeeded,
            items: ItemCounts {
                ok: 2,
                failed: 1,
                skipped: 0,
            },
            failed_stage: None,
            error: None,
            destination: Some("https://example.com/base/bascn123".to_string()),
            elapsed_secs: 42,
        };
        let text = Notification::Terminal(summary).text().unwrap();
        assert!(text.contains("demo"));
        assert!(text.contains("成功 2"));
        assert!(text.contains("bascn123"));
    }

    #[test]
    fn test_terminal_failure_names_stage() {
        let summary = JobSummary {
            job_id: JobId::new(),
            task_name: "demo".to_string(),
            status: JobStatus::Failed,
            items: ItemCounts::default(),
            failed_stage: Some(StageKind::Extract),
            error: Some("signal extraction tool exited with code 1".to_string()),
            destination: None,
            elapsed_secs: 3,
        };
        let text = Notification::Terminal(summary).text().unwrap();
        assert!(text.contains("extract"));
        assert!(text.contains("exited with code 1"));
    }

    #[test]
    fn test_stage_failed_names_stage_and_reason() {
        let text = Notification::StageFailed {
            kind: StageKind::Acquire,
            error: "no usable media links in source table".to_string(),
        }
        .text()
        .unwrap();
        assert!(text.contains("acquire"));
        assert!(text.contains("失败"));
        assert!(text.contains("no usable media links"));
    }

    #[test]
    fn test_config_prompt_has_no_text_form() {
        assert!(Notification::ConfigPrompt.text().is_none());
    }

    #[tokio::test]
    async fn test_memory_notifier_preserves_order() {
        let notifier = MemoryNotifier::new();
        let sid = SessionId::from("chat_1");
        notifier
            .notify(
                &sid,
                Notification::Accepted {
                    job_id: JobId::new(),
                    task_name: "t".to_string(),
                },
            )
            .await;
        notifier
            .notify(
                &sid,
                Notification::StageStarted {
                    kind: StageKind::Acquire,
                },
            )
            .await;

        let sent = notifier.sent_to(&sid).await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], Notification::Accepted { .. }));
        assert!(matches!(
            sent[1],
            Notification::StageStarted {
                kind: StageKind::Acquire
            }
        ));
    }
}
