//! Job configuration collected through the conversation dialogue
//!
//! A `PendingConfig` accumulates card field edits; a valid submit freezes it
//! into an immutable `JobConfiguration`.

use crate::error::InsightError;
use serde::{Deserialize, Serialize};

/// Reference to a table in the platform's table store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    /// App token of the containing base, or the wiki node token for links
    /// pasted from the knowledge base
    pub app_token: String,
    /// Table id within the base; `None` means the base's default table
    pub table_id: Option<String>,
    /// True when `app_token` is a wiki node token the table store must
    /// resolve to a base token first
    #[serde(default)]
    pub wiki: bool,
}

impl TableRef {
    /// Parse a pasted table URL. Both shapes are accepted:
    /// `https://<domain>/base/<app_token>?table=<table_id>&view=...` and
    /// `https://<domain>/wiki/<node_token>?table=<table_id>`.
    #[must_use]
    pub fn parse_url(url: &str) -> Option<Self> {
        let (rest, wiki) = match url.split("/base/").nth(1) {
            Some(rest) => (rest, false),
            None => (url.split("/wiki/").nth(1)?, true),
        };
        let app_token: String = rest
            .split(['?', '/'])
            .next()?
            .trim()
            .to_string();
        if app_token.is_empty() {
            return None;
        }

        let table_id = rest
            .split("table=")
            .nth(1)
            .map(|t| t.split('&').next().unwrap_or(t).to_string())
            .filter(|t| !t.is_empty());

        Some(Self {
            app_token,
            table_id,
            wiki,
        })
    }

    /// Shareable URL for this table under the given platform domain.
    #[must_use]
    pub fn url(&self, domain: &str) -> String {
        let segment = if self.wiki { "wiki" } else { "base" };
        match &self.table_id {
            Some(table_id) => format!("{domain}/{segment}/{}?table={table_id}", self.app_token),
            None => format!("{domain}/{segment}/{}", self.app_token),
        }
    }
}

/// Optional per-field analysis instruction supplied by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Destination field the rule constrains (e.g. "audience")
    pub field: String,
    /// Free-form instruction passed to the analysis model
    pub rule: String,
}

/// Immutable parameters of one job. Frozen at submit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Source table holding media references
    pub source: TableRef,
    /// Base name for the provisioned destination table
    pub task_name: String,
    /// Folder token the destination table is created under
    #[serde(default)]
    pub dest_folder: Option<String>,
    /// Per-field analysis rules
    #[serde(default)]
    pub field_rules: Vec<FieldRule>,
}

/// Card form field names, shared between the card renderer and the
/// submit handler.
pub mod form_fields {
    pub const SOURCE_LINK: &str = "source_table_link";
    pub const TASK_NAME: &str = "task_name";
    pub const FOLDER_TOKEN: &str = "folder_token";
}

/// Mutable configuration being collected in the `AwaitingConfig` phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfig {
    pub source_link: Option<String>,
    pub task_name: Option<String>,
    pub folder_token: Option<String>,
    pub field_rules: Vec<FieldRule>,
}

impl PendingConfig {
    /// Apply one card field edit. Unknown field names are ignored so a
    /// newer card schema cannot wedge an older server.
    pub fn set_field(&mut self, name: &str, value: &str) {
        let value = value.trim();
        match name {
            form_fields::SOURCE_LINK => self.source_link = Some(value.to_string()),
            form_fields::TASK_NAME => self.task_name = Some(value.to_string()),
            form_fields::FOLDER_TOKEN => {
                self.folder_token = Some(value.to_string()).filter(|v| !v.is_empty());
            }
            _ => {}
        }
    }

    /// Validate and freeze into a `JobConfiguration`.
    pub fn build(&self) -> Result<JobConfiguration, InsightError> {
        let link = self
            .source_link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| InsightError::InvalidConfig("source table link is required".into()))?;

        let source = TableRef::parse_url(link).ok_or_else(|| {
            InsightError::InvalidConfig(format!("not a recognizable base or wiki link: {link}"))
        })?;

        let task_name = self
            .task_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("video-analysis")
            .to_string();

        Ok(JobConfiguration {
            source,
            task_name,
            dest_folder: self.folder_token.clone(),
            field_rules: self.field_rules.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_with_table() {
        let r = TableRef::parse_url("https://example.feishu.cn/base/bascnAbC123?table=tblXyz&view=vewQ")
            .unwrap();
        assert_eq!(r.app_token, "bascnAbC123");
        assert_eq!(r.table_id.as_deref(), Some("tblXyz"));
    }

    #[test]
    fn test_parse_url_without_table() {
        let r = TableRef::parse_url("https://example.feishu.cn/base/bascnAbC123").unwrap();
        assert_eq!(r.app_token, "bascnAbC123");
        assert!(r.table_id.is_none());
    }

    #[test]
    fn test_parse_url_wiki_link() {
        let r = TableRef::parse_url("https://example.feishu.cn/wiki/wikcnXyz789?table=tblQ").unwrap();
        assert!(r.wiki);
        assert_eq!(r.app_token, "wikcnXyz789");
        assert_eq!(r.table_id.as_deref(), Some("tblQ"));

        let r = TableRef::parse_url("https://example.feishu.cn/wiki/wikcnXyz789").unwrap();
        assert!(r.wiki);
        assert!(r.table_id.is_none());
    }

    #[test]
    fn test_parse_url_rejects_unrecognized_links() {
        assert!(TableRef::parse_url("https://example.feishu.cn/docs/xyz").is_none());
        assert!(TableRef::parse_url("not a url").is_none());
        assert!(TableRef::parse_url("https://example.feishu.cn/base/").is_none());
        assert!(TableRef::parse_url("https://example.feishu.cn/wiki/").is_none());
    }

    #[test]
    fn test_table_url_roundtrip() {
        let r = TableRef {
            app_token: "bascnA".to_string(),
            table_id: Some("tblB".to_string()),
            wiki: false,
        };
        let url = r.url("https://example.feishu.cn");
        assert_eq!(TableRef::parse_url(&url).unwrap(), r);

        let w = TableRef {
            app_token: "wikcnC".to_string(),
            table_id: None,
            wiki: true,
        };
        assert_eq!(TableRef::parse_url(&w.url("https://x.feishu.cn")).unwrap(), w);
    }

    #[test]
    fn test_pending_config_build_requires_source() {
        let pending = PendingConfig::default();
        assert!(pending.build().is_err());
    }

    #[test]
    fn test_pending_config_build_defaults_task_name() {
        let mut pending = PendingConfig::default();
        pending.set_field(
            form_fields::SOURCE_LINK,
            "https://example.feishu.cn/base/bascnA?table=tblB",
        );
        let config = pending.build().unwrap();
        assert_eq!(config.task_name, "video-analysis");
        assert_eq!(config.source.app_token, "bascnA");
    }

    #[test]
    fn test_pending_config_ignores_unknown_fields() {
        let mut pending = PendingConfig::default();
        pending.set_field("future_field", "value");
        assert_eq!(pending, PendingConfig::default());
    }

    #[test]
    fn test_empty_folder_token_treated_as_absent() {
        let mut pending = PendingConfig::default();
        pending.set_field(form_fields::FOLDER_TOKEN, "   ");
        assert!(pending.folder_token.is_none());
    }
}
