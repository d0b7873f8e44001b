use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Record — matches the `record` table in PostgreSQL.
///
/// Records are immutable log entries. `record_index` increases from 0 per
/// stream without gaps; `hash` chains each record to its predecessor.
/// Soft deletion appends a marker (`deleted = true`, empty content);
/// purging empties content in place while keeping the hash fields so the
/// chain stays verifiable.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Record {
    pub id: String,
    pub stream_id: String,
    #[sqlx(rename = "record_index")]
    pub index: i64,
    pub name: String,
    pub path: String,
    pub content: Vec<u8>,
    pub content_type: String,
    pub size: i64,
    pub content_hash: String,
    pub hash: String,
    pub previous_hash: Option<String>,
    pub user_id: String,
    pub headers: Option<serde_json::Value>,
    pub deleted: bool,
    pub purged: bool,
    pub storage: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Wire representation of a record in JSON listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecord {
    pub index: i64,
    pub name: String,
    pub path: String,
    pub content: serde_json::Value,
    pub content_type: String,
    pub size: i64,
    pub content_hash: String,
    pub hash: String,
    pub previous_hash: Option<String>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    pub deleted: bool,
    pub purged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Render stored bytes for JSON transport: JSON content inline, UTF-8
    /// text as a string, anything else base64-encoded.
    pub fn content_value(&self) -> serde_json::Value {
        if self.content.is_empty() {
            return serde_json::Value::String(String::new());
        }
        if self.content_type == "application/json" || self.content_type.ends_with("+json") {
            if let Ok(v) = serde_json::from_slice(&self.content) {
                return v;
            }
        }
        match std::str::from_utf8(&self.content) {
            Ok(text) if self.content_type.starts_with("text/") => {
                serde_json::Value::String(text.to_string())
            }
            _ => serde_json::Value::String(BASE64.encode(&self.content)),
        }
    }

    pub fn to_api(&self) -> ApiRecord {
        ApiRecord {
            index: self.index,
            name: self.name.clone(),
            path: self.path.clone(),
            content: self.content_value(),
            content_type: self.content_type.clone(),
            size: self.size,
            content_hash: self.content_hash.clone(),
            hash: self.hash.clone(),
            previous_hash: self.previous_hash.clone(),
            user_id: self.user_id.clone(),
            headers: self.headers.clone(),
            deleted: self.deleted,
            purged: self.purged,
            storage: self.storage.clone(),
            created_at: self.created_at,
        }
    }
}

/// Paginated record listing envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList {
    pub records: Vec<ApiRecord>,
    pub total: i64,
    pub limit: i64,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(content: &[u8], content_type: &str) -> Record {
        Record {
            id: "r1".to_string(),
            stream_id: "s1".to_string(),
            index: 0,
            name: "first".to_string(),
            path: "docs/first".to_string(),
            content: content.to_vec(),
            content_type: content_type.to_string(),
            size: content.len() as i64,
            content_hash: crate::utils::hash::content_hash(content),
            hash: String::new(),
            previous_hash: None,
            user_id: "user-1".to_string(),
            headers: None,
            deleted: false,
            purged: false,
            storage: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_json_content_rendered_inline() {
        let r = record_with(b"{\"a\":1}", "application/json");
        assert_eq!(r.content_value(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_text_content_rendered_as_string() {
        let r = record_with(b"hello", "text/plain");
        assert_eq!(r.content_value(), serde_json::json!("hello"));
    }

    #[test]
    fn test_binary_content_rendered_as_base64() {
        let r = record_with(&[0xde, 0xad, 0xbe, 0xef], "application/octet-stream");
        assert_eq!(r.content_value(), serde_json::json!(BASE64.encode([0xde, 0xad, 0xbe, 0xef])));
    }
}
