use serde::{Deserialize, Serialize};

/// Decoded content of a permission-stream record.
///
/// Permission streams are ordinary streams used as access-control lists:
/// each record is named after the target user id, and the latest record
/// per name wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub id: String,
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default)]
    pub write: Option<bool>,
}

impl PermissionGrant {
    pub fn allows_read(&self) -> bool {
        self.read.unwrap_or(false)
    }

    pub fn allows_write(&self) -> bool {
        self.write.unwrap_or(false)
    }
}

/// Content of the latest record in a pod's `.config/owner` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub owner: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_decoding() {
        let g: PermissionGrant =
            serde_json::from_str(r#"{"id": "user-x", "read": true}"#).unwrap();
        assert_eq!(g.id, "user-x");
        assert!(g.allows_read());
        assert!(!g.allows_write());
    }

    #[test]
    fn test_missing_flags_deny() {
        let g: PermissionGrant = serde_json::from_str(r#"{"id": "user-x"}"#).unwrap();
        assert!(!g.allows_read());
        assert!(!g.allows_write());
    }
}
