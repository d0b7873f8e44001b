use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Pod record — matches the `pod` table in PostgreSQL.
///
/// A pod is a per-user namespace addressed by DNS subdomain. Ownership is
/// not a column: it is the latest record named `owner` in the pod's
/// `.config/owner` stream.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub name: String,
    pub created_at: DateTime<Utc>,
}
