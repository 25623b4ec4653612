//! HTTP delivery to the chat platform
//!
//! Sends messages through the platform's REST API with an app-scoped
//! tenant token. The token is cached until shortly before expiry and
//! refreshed once if the platform reports it invalid mid-flight.

use crate::{card, Notification, Notifier};
use async_trait::async_trait;
use insight_common::SessionId;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Invalid-token code returned by the platform alongside HTTP 200.
const CODE_TOKEN_INVALID: i64 = 99_991_663;

/// Refresh this long before the reported expiry.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// Delivery attempts per message: the first send plus two retries.
const SEND_ATTEMPTS: u32 = 3;

const SEND_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub app_id: String,
    pub app_secret: String,
    /// Platform API origin, e.g. `https://open.feishu.cn`.
    pub domain: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Production [`Notifier`] backed by the chat platform's messaging API.
pub struct ChatNotifier {
    config: ChatConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

#[derive(Deserialize)]
struct SendResponse {
    code: i64,
    msg: String,
}

impl ChatNotifier {
    #[must_use]
    pub fn new(config: ChatConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            token: Mutex::new(None),
        }
    }

    async fn tenant_token(&self, force_refresh: bool) -> Result<String, String> {
        let mut cached = self.token.lock().await;
        if !force_refresh {
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Instant::now() {
                    return Ok(token.value.clone());
                }
            }
        }

        let url = format!(
            "{}/open-apis/auth/v3/tenant_access_token/internal",
            self.config.domain
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "app_id": self.config.app_id,
                "app_secret": self.config.app_secret,
            }))
            .send()
            .await
            .map_err(|e| format!("token request failed: {e}"))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("token response unreadable: {e}"))?;
        if body.code != 0 {
            return Err(format!("token refresh rejected: {} {}", body.code, body.msg));
        }

        let expires_at =
            Instant::now() + Duration::from_secs(body.expire).saturating_sub(TOKEN_SLACK);
        *cached = Some(CachedToken {
            value: body.tenant_access_token.clone(),
            expires_at,
        });
        debug!("tenant token refreshed");
        Ok(body.tenant_access_token)
    }

    async fn send(
        &self,
        session_id: &SessionId,
        msg_type: &str,
        content: String,
    ) -> Result<(), String> {
        let url = format!(
            "{}/open-apis/im/v1/messages?receive_id_type=open_id",
            self.config.domain
        );

        let mut force_refresh = false;
        let mut last_error = String::new();
        for attempt in 1..=SEND_ATTEMPTS {
            if attempt > 1 {
                warn!(attempt, error = %last_error, "retrying message delivery");
                tokio::time::sleep(SEND_RETRY_DELAY).await;
            }
            match self
                .try_send(&url, session_id, msg_type, &content, force_refresh)
                .await
            {
                Ok(()) => return Ok(()),
                Err(SendFailure::Reject(reason)) => return Err(reason),
                Err(SendFailure::Retry {
                    reason,
                    refresh_token,
                }) => {
                    force_refresh = refresh_token;
                    last_error = reason;
                }
            }
        }
        Err(last_error)
    }

    async fn try_send(
        &self,
        url: &str,
        session_id: &SessionId,
        msg_type: &str,
        content: &str,
        force_refresh: bool,
    ) -> Result<(), SendFailure> {
        let token = self
            .tenant_token(force_refresh)
            .await
            .map_err(SendFailure::retry)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(&json!({
                "receive_id": session_id.as_str(),
                "msg_type": msg_type,
                "content": content,
            }))
            .send()
            .await
            .map_err(|e| SendFailure::retry(format!("send failed: {e}")))?;

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| SendFailure::retry(format!("send response unreadable: {e}")))?;
        if body.code == 0 {
            return Ok(());
        }
        if body.code == CODE_TOKEN_INVALID {
            return Err(SendFailure::Retry {
                reason: format!("tenant token invalidated: {}", body.msg),
                refresh_token: true,
            });
        }
        // An explicit rejection never gets better on replay.
        Err(SendFailure::Reject(format!(
            "platform rejected message: {} {}",
            body.code, body.msg
        )))
    }
}

enum SendFailure {
    Retry { reason: String, refresh_token: bool },
    Reject(String),
}

impl SendFailure {
    fn retry(reason: String) -> Self {
        Self::Retry {
            reason,
            refresh_token: false,
        }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn notify(&self, session_id: &SessionId, notification: Notification) {
        let (msg_type, content) = match &notification {
            Notification::ConfigPrompt => ("interactive", card::config_card().to_string()),
            other => match other.text() {
                Some(text) => ("text", json!({ "text": text }).to_string()),
                None => return,
            },
        };

        if let Err(e) = self.send(session_id, msg_type, content).await {
            // Best effort: notification loss never affects the job.
            error!(session = %session_id, error = %e, "failed to deliver notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_payload_is_nested_json() {
        let content = json!({ "text": "pong" }).to_string();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["text"], "pong");
    }

    #[tokio::test]
    async fn test_notifier_constructs_without_network() {
        let notifier = ChatNotifier::new(ChatConfig {
            app_id: "cli_test".to_string(),
            app_secret: "secret".to_string(),
            domain: "https://open.example.com".to_string(),
        });
        assert!(notifier.token.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_delivery_retries_transient_failures() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        // A listener that drops every connection on accept: each delivery
        // attempt dies at the token fetch with a transport error.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let notifier = ChatNotifier::new(ChatConfig {
            app_id: "cli_test".to_string(),
            app_secret: "secret".to_string(),
            domain: format!("http://{addr}"),
        });
        notifier
            .notify(&SessionId::from("ou_x"), Notification::Pong)
            .await;

        assert_eq!(connections.load(Ordering::SeqCst), SEND_ATTEMPTS);
    }
}
