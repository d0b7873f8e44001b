use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stream record — matches the `stream` table in PostgreSQL.
///
/// A stream is a node in a per-pod tree. `path` is the slash-joined chain
/// of segment names from the root and is kept in lockstep with the parent
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    pub pod_name: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub path: String,
    pub user_id: String,
    pub access_permission: String,
    pub metadata: Option<serde_json::Value>,
    pub has_schema: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recognized access-permission forms.
///
/// Anything else must be rejected at set time: `public`, `private`,
/// `inherit`, or a `/`-prefixed path naming a permission stream in the
/// same pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMode<'a> {
    Public,
    Private,
    Inherit,
    PermissionStream(&'a str),
}

impl Stream {
    pub fn access_mode(&self) -> AccessMode<'_> {
        match self.access_permission.as_str() {
            "private" => AccessMode::Private,
            "inherit" => AccessMode::Inherit,
            s if s.starts_with('/') => AccessMode::PermissionStream(s.trim_start_matches('/')),
            _ => AccessMode::Public,
        }
    }
}

/// Validate an access-permission value supplied through the API.
pub fn is_valid_access_permission(value: &str) -> bool {
    match value {
        "public" | "private" | "inherit" => true,
        s => {
            s.starts_with('/') && crate::utils::validation::is_valid_stream_path(&s[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_access(access: &str) -> Stream {
        Stream {
            id: "s1".to_string(),
            pod_name: "alice".to_string(),
            parent_id: None,
            name: "docs".to_string(),
            path: "docs".to_string(),
            user_id: "user-1".to_string(),
            access_permission: access.to_string(),
            metadata: None,
            has_schema: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_access_modes() {
        assert_eq!(stream_with_access("public").access_mode(), AccessMode::Public);
        assert_eq!(stream_with_access("private").access_mode(), AccessMode::Private);
        assert_eq!(stream_with_access("inherit").access_mode(), AccessMode::Inherit);
        assert_eq!(
            stream_with_access("/team-perms").access_mode(),
            AccessMode::PermissionStream("team-perms")
        );
    }

    #[test]
    fn test_access_permission_validation() {
        assert!(is_valid_access_permission("public"));
        assert!(is_valid_access_permission("private"));
        assert!(is_valid_access_permission("inherit"));
        assert!(is_valid_access_permission("/team-perms"));
        assert!(is_valid_access_permission("/acl/readers"));
        assert!(!is_valid_access_permission("open"));
        assert!(!is_valid_access_permission("/"));
        assert!(!is_valid_access_permission("/bad path"));
    }
}
