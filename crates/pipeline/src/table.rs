//! Table store collaborator
//!
//! Reads media rows from the source table and writes analysis rows into the
//! provisioned destination table through the platform's REST API. All
//! requests carry an app-scoped tenant token, cached until shortly before
//! expiry.

use crate::analyze::AnalysisRow;
use async_trait::async_trait;
use insight_common::{FieldRule, StageError, TableRef};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Source column holding the material name.
pub const FIELD_NAME: &str = "素材名称";

/// Source column holding the media link.
pub const FIELD_URL: &str = "视频链接";

/// One record read from the source table.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub record_id: String,
    pub fields: Map<String, Value>,
}

impl SourceRow {
    /// Material name, the stable item key.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.fields.get(FIELD_NAME).and_then(field_text)
    }

    /// Media URL. Link columns surface as a plain string, an array of link
    /// objects, or a single link object depending on the column type.
    #[must_use]
    pub fn media_url(&self) -> Option<String> {
        let value = self.fields.get(FIELD_URL)?;
        extract_url(value)
    }

    /// Every other column, passed to analysis as delivery metrics.
    #[must_use]
    pub fn metrics(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter(|(k, _)| k.as_str() != FIELD_NAME && k.as_str() != FIELD_URL)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        // Text columns can surface as segment arrays.
        Value::Array(parts) => {
            let joined: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            Some(joined.trim().to_string()).filter(|s| !s.is_empty())
        }
        _ => None,
    }
}

fn extract_url(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(|first| {
            ["url", "link", "text"]
                .iter()
                .find_map(|k| first.get(k).and_then(Value::as_str))
                .map(str::to_string)
        }),
        Value::Object(obj) => ["url", "link"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }?;
    let raw = raw.trim().to_string();
    raw.starts_with("http").then_some(raw)
}

/// One analysis row bound for the destination table.
#[derive(Debug, Clone)]
pub struct ResultRow {
    /// Material name; upserts are keyed on it
    pub key: String,
    pub fields: AnalysisRow,
}

/// Platform table operations the pipeline depends on.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// All records of the table, fetched with pagination.
    async fn list_rows(&self, table: &TableRef) -> Result<Vec<SourceRow>, StageError>;

    /// Create a fresh base under `folder` and resolve its default table.
    async fn create_table(&self, name: &str, folder: Option<&str>) -> Result<TableRef, StageError>;

    /// Grant the requesting user full access to the base.
    async fn grant_access(&self, table: &TableRef, member_id: &str) -> Result<(), StageError>;

    /// Create the destination columns, including one text column per
    /// user-supplied field rule.
    async fn init_fields(&self, table: &TableRef, rules: &[FieldRule]) -> Result<(), StageError>;

    /// Write analysis rows, keyed by material name. Re-running with the
    /// same rows must not duplicate them.
    async fn upsert_rows(&self, table: &TableRef, rows: &[ResultRow]) -> Result<(), StageError>;

    /// Shareable link for a table.
    fn table_url(&self, table: &TableRef) -> String;
}

#[derive(Debug, Clone)]
pub struct BitableConfig {
    pub domain: String,
    pub app_id: String,
    pub app_secret: String,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Production [`TableStore`] over the platform's bitable REST API.
pub struct BitableStore {
    config: BitableConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

impl BitableStore {
    #[must_use]
    pub fn new(config: BitableConfig) -> Self {
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

    async fn tenant_token(&self) -> Result<String, StageError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
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
            .map_err(|e| StageError::transient(format!("token request failed: {e}")))?;

        #[derive(Deserialize)]
        struct TokenBody {
            code: i64,
            msg: String,
            #[serde(default)]
            tenant_access_token: String,
            #[serde(default)]
            expire: u64,
        }
        let body: TokenBody = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("token response unreadable: {e}")))?;
        if body.code != 0 {
            return Err(StageError::permanent(format!(
                "token refresh rejected: {} {}",
                body.code, body.msg
            )));
        }

        let expires_at = Instant::now()
            + Duration::from_secs(body.expire).saturating_sub(Duration::from_secs(60));
        *cached = Some(CachedToken {
            value: body.tenant_access_token.clone(),
            expires_at,
        });
        Ok(body.tenant_access_token)
    }

    async fn call(
        &self,
        method: reqwest::Method,
        url: String,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, StageError> {
        let token = self.tenant_token().await?;
        let mut request = self.client.request(method, &url).bearer_auth(&token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StageError::transient(format!("table api unreachable: {e}")))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(StageError::transient(format!("table api returned {status}")));
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("table api response unreadable: {e}")))?;
        if envelope.code != 0 {
            return Err(StageError::permanent(format!(
                "table api rejected request: {} {}",
                envelope.code, envelope.msg
            )));
        }
        Ok(envelope.data)
    }

    fn records_url(&self, app_token: &str, table_id: &str) -> String {
        format!(
            "{}/open-apis/bitable/v1/apps/{app_token}/tables/{table_id}/records",
            self.config.domain
        )
    }

    fn require_table_id<'a>(&self, table: &'a TableRef) -> Result<&'a str, StageError> {
        table
            .table_id
            .as_deref()
            .ok_or_else(|| StageError::permanent("table reference has no table id".to_string()))
    }

    /// Base app token behind a table reference. Wiki links carry a node
    /// token that the wiki API maps to the underlying base.
    async fn resolve_app_token(&self, table: &TableRef) -> Result<String, StageError> {
        if !table.wiki {
            return Ok(table.app_token.clone());
        }

        let data = self
            .call(
                reqwest::Method::GET,
                format!("{}/open-apis/wiki/v2/space_node/get", self.config.domain),
                &[("token", table.app_token.as_str())],
                None,
            )
            .await?;

        let node = &data["node"];
        if node["obj_type"].as_str() != Some("bitable") {
            return Err(StageError::permanent(format!(
                "wiki node {} is not a bitable (got {})",
                table.app_token,
                node["obj_type"].as_str().unwrap_or("nothing")
            )));
        }
        node["obj_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StageError::permanent("wiki node carries no base token".to_string()))
    }

    async fn default_table_id(&self, app_token: &str) -> Result<String, StageError> {
        let data = self
            .call(
                reqwest::Method::GET,
                format!(
                    "{}/open-apis/bitable/v1/apps/{app_token}/tables",
                    self.config.domain
                ),
                &[],
                None,
            )
            .await?;
        data["items"][0]["table_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StageError::permanent("created base has no default table".to_string()))
    }

    /// Existing destination rows keyed by material name, for idempotent
    /// upserts.
    async fn existing_keys(
        &self,
        app_token: &str,
        table_id: &str,
    ) -> Result<std::collections::HashMap<String, String>, StageError> {
        let rows = self.list_rows_inner(app_token, table_id).await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.name().map(|n| (n, r.record_id)))
            .collect())
    }

    async fn list_rows_inner(
        &self,
        app_token: &str,
        table_id: &str,
    ) -> Result<Vec<SourceRow>, StageError> {
        let mut all = Vec::new();
        let mut page_token = String::new();
        loop {
            let data = self
                .call(
                    reqwest::Method::GET,
                    self.records_url(app_token, table_id),
                    &[("page_size", "100"), ("page_token", page_token.as_str())],
                    None,
                )
                .await?;

            if let Some(items) = data["items"].as_array() {
                for item in items {
                    let record_id = item["record_id"].as_str().unwrap_or_default().to_string();
                    let fields = item["fields"].as_object().cloned().unwrap_or_default();
                    all.push(SourceRow { record_id, fields });
                }
            }

            if data["has_more"].as_bool().unwrap_or(false) {
                page_token = data["page_token"].as_str().unwrap_or_default().to_string();
            } else {
                break;
            }
        }
        debug!(count = all.len(), "fetched table records");
        Ok(all)
    }
}

#[async_trait]
impl TableStore for BitableStore {
    async fn list_rows(&self, table: &TableRef) -> Result<Vec<SourceRow>, StageError> {
        let app_token = self.resolve_app_token(table).await?;
        // A link without a table= query means the base's first table.
        let table_id = match &table.table_id {
            Some(id) => id.clone(),
            None => self.default_table_id(&app_token).await?,
        };
        self.list_rows_inner(&app_token, &table_id).await
    }

    async fn create_table(&self, name: &str, folder: Option<&str>) -> Result<TableRef, StageError> {
        info!(name, "creating destination base");
        let data = self
            .call(
                reqwest::Method::POST,
                format!("{}/open-apis/bitable/v1/apps", self.config.domain),
                &[],
                Some(json!({
                    "name": name,
                    "folder_token": folder.unwrap_or_default(),
                })),
            )
            .await?;

        let app_token = data["app"]["app_token"]
            .as_str()
            .ok_or_else(|| StageError::permanent("create base response missing app token".to_string()))?
            .to_string();
        let table_id = self.default_table_id(&app_token).await?;
        Ok(TableRef {
            app_token,
            table_id: Some(table_id),
            wiki: false,
        })
    }

    async fn grant_access(&self, table: &TableRef, member_id: &str) -> Result<(), StageError> {
        self.call(
            reqwest::Method::POST,
            format!(
                "{}/open-apis/drive/v1/permissions/{}/members",
                self.config.domain, table.app_token
            ),
            &[("type", "bitable"), ("need_notification", "true")],
            Some(json!({
                "member_type": "openid",
                "member_id": member_id,
                "perm": "full_access",
            })),
        )
        .await?;
        Ok(())
    }

    async fn init_fields(&self, table: &TableRef, rules: &[FieldRule]) -> Result<(), StageError> {
        let table_id = self.require_table_id(table)?.to_string();
        let url = format!(
            "{}/open-apis/bitable/v1/apps/{}/tables/{table_id}/fields",
            self.config.domain, table.app_token
        );

        // Field type ids: 1 text, 15 url.
        let mut fields: Vec<(String, i64)> = vec![
            (FIELD_NAME.to_string(), 1),
            (FIELD_URL.to_string(), 15),
            ("概述".to_string(), 1),
            ("分析".to_string(), 1),
        ];
        for rule in rules {
            fields.push((rule.field.clone(), 1));
        }

        for (field_name, type_id) in fields {
            let result = self
                .call(
                    reqwest::Method::POST,
                    url.clone(),
                    &[],
                    Some(json!({ "field_name": field_name, "type": type_id })),
                )
                .await;
            // A pre-existing column (the base's default text column) is fine.
            if let Err(e) = result {
                warn!(field = %field_name, error = %e, "field creation failed");
            }
        }
        Ok(())
    }

    async fn upsert_rows(&self, table: &TableRef, rows: &[ResultRow]) -> Result<(), StageError> {
        let table_id = self.require_table_id(table)?.to_string();
        let existing = self.existing_keys(&table.app_token, &table_id).await?;
        let base_url = self.records_url(&table.app_token, &table_id);

        for row in rows {
            let body = json!({ "fields": Value::Object(row.fields.clone()) });
            match existing.get(&row.key) {
                Some(record_id) => {
                    self.call(
                        reqwest::Method::PUT,
                        format!("{base_url}/{record_id}"),
                        &[],
                        Some(body),
                    )
                    .await?;
                }
                None => {
                    self.call(reqwest::Method::POST, base_url.clone(), &[], Some(body))
                        .await?;
                }
            }
            // Platform rate limit headroom.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        info!(count = rows.len(), "synced analysis rows");
        Ok(())
    }

    fn table_url(&self, table: &TableRef) -> String {
        table.url(&self.config.domain)
    }
}
