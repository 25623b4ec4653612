//! HTTP request handlers
//!
//! The webhook handler only normalizes, dedups, and acknowledges; all
//! conversation and job work happens in a spawned task so the response
//! stays inside the platform's redelivery window.

use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use insight_events::{normalize, CanonicalEvent, EventKind, Inbound};
use insight_notify::Notification;
use insight_session::{SessionReply, SubmitOutcome};
use serde_json::json;
use tracing::{info, warn};

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn webhook_event(State(state): State<AppState>, body: Bytes) -> Response {
    match normalize(&body, &state.verification_token) {
        Err(e) => {
            warn!(error = %e, "rejected inbound event");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Ok(Inbound::Challenge { challenge }) => {
            info!("answering verification challenge");
            Json(json!({ "challenge": challenge })).into_response()
        }
        Ok(Inbound::Event(event)) => {
            // Redeliveries get the same acknowledgement and no side effects.
            if !state.dedup.lock().await.insert(&event.event_id) {
                return StatusCode::OK.into_response();
            }
            let state = state.clone();
            tokio::spawn(async move {
                dispatch(state, event).await;
            });
            StatusCode::OK.into_response()
        }
    }
}

async fn dispatch(state: AppState, event: CanonicalEvent) {
    let session_id = event.session_id;
    match event.kind {
        EventKind::Message { text } => {
            let reply = state.sessions.on_message(&session_id, &text).await;
            if let Some(notification) = reply_notification(reply) {
                state.notifier.notify(&session_id, notification).await;
            }
        }
        EventKind::CardEdit { field, value } => {
            let reply = state.sessions.on_card_edit(&session_id, &field, &value).await;
            if let Some(notification) = reply_notification(reply) {
                state.notifier.notify(&session_id, notification).await;
            }
        }
        EventKind::CardSubmit { form } => {
            match state.sessions.on_card_submit(&session_id, &form).await {
                SubmitOutcome::Launch(config) => {
                    // The driver task sends the acceptance notification.
                    if let Err(e) = state
                        .orchestrator
                        .create_job(session_id.clone(), config)
                        .await
                    {
                        warn!(session = %session_id, error = %e, "job launch refused");
                        state.sessions.abort_confirmation(&session_id).await;
                        state.notifier.notify(&session_id, Notification::Busy).await;
                    }
                }
                SubmitOutcome::Reply(reply) => {
                    if let Some(notification) = reply_notification(reply) {
                        state.notifier.notify(&session_id, notification).await;
                    }
                }
            }
        }
    }
}

/// Dialogue replies rendered by the notifier; `Silent` sends nothing.
fn reply_notification(reply: SessionReply) -> Option<Notification> {
    match reply {
        SessionReply::ConfigPrompt => Some(Notification::ConfigPrompt),
        SessionReply::UsageHint => Some(Notification::UsageHint),
        SessionReply::Pong => Some(Notification::Pong),
        SessionReply::ValidationFeedback(msg) => Some(Notification::ValidationFeedback(msg)),
        SessionReply::SessionBusy => Some(Notification::Busy),
        SessionReply::Silent => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_reply_sends_nothing() {
        assert!(reply_notification(SessionReply::Silent).is_none());
        assert_eq!(
            reply_notification(SessionReply::Pong),
            Some(Notification::Pong)
        );
    }
}
