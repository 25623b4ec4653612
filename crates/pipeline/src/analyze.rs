//! Multimodal analysis collaborator
//!
//! Sends one item's frame sheet, transcript, and delivery metrics to the
//! vision model endpoint and parses the structured JSON it returns. The
//! model must answer with a flat JSON object whose keys become destination
//! table columns.

use async_trait::async_trait;
use base64::Engine;
use insight_common::{FieldRule, StageError};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Flat field map produced by the model for one item.
pub type AnalysisRow = Map<String, Value>;

/// Everything the model sees for one item.
pub struct AnalysisRequest<'a> {
    pub name: &'a str,
    pub frame_sheet: &'a Path,
    pub transcript: Option<&'a str>,
    pub metrics: &'a Map<String, Value>,
    pub field_rules: &'a [FieldRule],
}

#[async_trait]
pub trait AnalysisClient: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<AnalysisRow, StageError>;
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

/// Production client for a multimodal generation API.
pub struct VisionAnalysisClient {
    config: AnalysisConfig,
    client: reqwest::Client,
}

impl VisionAnalysisClient {
    #[must_use]
    pub fn new(config: AnalysisConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn system_prompt(rules: &[FieldRule]) -> String {
        let mut prompt = String::from(
            "你是短视频投放分析专家。根据提供的视频拼图、文案和投放数据，\
             输出结构化分析。直接返回标准 JSON 对象，不要包含 Markdown 标记。\
             必须包含字段：概述、分析。",
        );
        for rule in rules {
            prompt.push_str(&format!("\n字段「{}」要求：{}", rule.field, rule.rule));
        }
        prompt
    }

    fn user_text(request: &AnalysisRequest<'_>) -> String {
        let transcript = request.transcript.unwrap_or("（无文案）");
        let metrics: String = request
            .metrics
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "【素材名称】：{}\n【视频文案】：\n{transcript}\n\n【投放数据】：\n{metrics}\n\n请根据上述素材和数据进行分析。",
            request.name
        )
    }
}

/// The model tends to wrap JSON in markdown fences despite instructions.
fn strip_fences(content: &str) -> String {
    content
        .replace("```json", "")
        .replace("```", "")
        .trim()
        .to_string()
}

#[async_trait]
impl AnalysisClient for VisionAnalysisClient {
    async fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<AnalysisRow, StageError> {
        let image_bytes = tokio::fs::read(request.frame_sheet)
            .await
            .map_err(|e| StageError::permanent(format!("frame sheet unreadable: {e}")))?;
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);

        let payload = json!({
            "model": self.config.model,
            "input": {
                "messages": [
                    {
                        "role": "system",
                        "content": [{ "text": Self::system_prompt(request.field_rules) }]
                    },
                    {
                        "role": "user",
                        "content": [
                            { "image": format!("data:image/jpeg;base64,{image_b64}") },
                            { "text": Self::user_text(request) }
                        ]
                    }
                ]
            },
            "parameters": { "result_format": "message" }
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| StageError::transient(format!("analysis request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(StageError::transient(format!("analysis api returned {status}")));
        }
        if !status.is_success() {
            return Err(StageError::permanent(format!("analysis api rejected request: {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("analysis response unreadable: {e}")))?;

        let content = body["output"]["choices"][0]["message"]["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                StageError::permanent(format!("unexpected analysis response shape: {body}"))
            })?;

        let cleaned = strip_fences(content);
        let row: AnalysisRow = serde_json::from_str(&cleaned).map_err(|e| {
            StageError::permanent(format!("model returned unparsable analysis: {e}"))
        })?;
        debug!(item = request.name, fields = row.len(), "analysis complete");
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        let fenced = "```json\n{\"概述\": \"x\"}\n```";
        assert_eq!(strip_fences(fenced), "{\"概述\": \"x\"}");
        assert_eq!(strip_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_system_prompt_includes_field_rules() {
        let rules = vec![FieldRule {
            field: "人群".to_string(),
            rule: "只能从既有选项中选择".to_string(),
        }];
        let prompt = VisionAnalysisClient::system_prompt(&rules);
        assert!(prompt.contains("人群"));
        assert!(prompt.contains("只能从既有选项中选择"));
    }

    #[test]
    fn test_user_text_mentions_metrics() {
        let mut metrics = Map::new();
        metrics.insert("点击".to_string(), json!(120));
        let request = AnalysisRequest {
            name: "spring_promo",
            frame_sheet: Path::new("/tmp/sheet.jpg"),
            transcript: Some("买它"),
            metrics: &metrics,
            field_rules: &[],
        };
        let text = VisionAnalysisClient::user_text(&request);
        assert!(text.contains("spring_promo"));
        assert!(text.contains("点击: 120"));
        assert!(text.contains("买它"));
    }
}
