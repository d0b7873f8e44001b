use sqlx::PgPool;

use crate::{
    error::ApiError,
    models::{
        permission::{OwnerRecord, PermissionGrant},
        stream::{AccessMode, Stream},
    },
    utils::validation::is_system_stream_path,
};

/// Access kinds the resolver decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Unified permission resolver.
///
/// Walks the stream hierarchy and any referenced permission streams. The
/// reference cycle (streams own records, permission streams are read to
/// authorize streams) is confined to data: this resolver only issues
/// point queries against the record log.
pub struct PermissionService {
    db: PgPool,
}

impl PermissionService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Current pod owner: the latest record named `owner` in the pod's
    /// `.config/owner` stream.
    pub async fn pod_owner(&self, pod: &str) -> Result<Option<String>, ApiError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT r.content FROM record r
            JOIN stream s ON s.id = r.stream_id
            WHERE s.pod_name = $1 AND s.path = '.config/owner'
              AND r.name = 'owner' AND NOT r.deleted AND NOT r.purged
            ORDER BY r.record_index DESC
            LIMIT 1
            "#,
        )
        .bind(pod)
        .fetch_optional(&self.db)
        .await?;

        Ok(row
            .and_then(|(content,)| serde_json::from_slice::<OwnerRecord>(&content).ok())
            .map(|o| o.owner))
    }

    pub async fn require_owner(&self, pod: &str, user_id: &str) -> Result<(), ApiError> {
        match self.pod_owner(pod).await? {
            Some(owner) if owner == user_id => Ok(()),
            _ => Err(ApiError::Forbidden(
                "only the pod owner may perform this action".to_string(),
            )),
        }
    }

    pub async fn can_read(
        &self,
        stream: &Stream,
        user_id: Option<&str>,
    ) -> Result<bool, ApiError> {
        self.resolve(stream, user_id, Access::Read).await
    }

    pub async fn can_write(&self, stream: &Stream, user_id: &str) -> Result<bool, ApiError> {
        self.resolve(stream, Some(user_id), Access::Write).await
    }

    async fn resolve(
        &self,
        stream: &Stream,
        user_id: Option<&str>,
        access: Access,
    ) -> Result<bool, ApiError> {
        let owner = self.pod_owner(&stream.pod_name).await?;

        // The pod owner has full access to every stream in the pod.
        if let (Some(user), Some(owner)) = (user_id, owner.as_deref()) {
            if user == owner {
                return Ok(true);
            }
        }

        // System streams are owner-territory for writes regardless of
        // their nominal permission.
        if access == Access::Write && is_system_stream_path(&stream.path) {
            return Ok(false);
        }

        let mut current = stream.clone();
        loop {
            // The creator keeps access while they are still the owner, or
            // while no owner record exists yet (pod bootstrap).
            if let Some(user) = user_id {
                if user == current.user_id && owner.as_deref().map_or(true, |o| o == user) {
                    return Ok(true);
                }
            }

            match current.access_mode() {
                AccessMode::Public => {
                    return Ok(match access {
                        Access::Read => true,
                        // Public streams are world-readable but writes
                        // still require a principal.
                        Access::Write => user_id.is_some(),
                    });
                }
                AccessMode::Private => return Ok(false),
                AccessMode::PermissionStream(path) => {
                    let Some(user) = user_id else {
                        return Ok(false);
                    };
                    let grant = self.lookup_grant(&current.pod_name, path, user).await?;
                    return Ok(match (grant, access) {
                        (Some(g), Access::Read) => g.allows_read(),
                        (Some(g), Access::Write) => g.allows_write(),
                        (None, _) => false,
                    });
                }
                AccessMode::Inherit => match &current.parent_id {
                    Some(parent_id) => {
                        let Some(parent) = self.fetch_by_id(parent_id).await? else {
                            return Ok(false);
                        };
                        current = parent;
                    }
                    // No decision anywhere along the chain: deny.
                    None => return Ok(false),
                },
            }
        }
    }

    /// Latest grant for `user_id` in the named permission stream of the
    /// same pod. Record name = target user id, last record per name wins.
    async fn lookup_grant(
        &self,
        pod: &str,
        permission_path: &str,
        user_id: &str,
    ) -> Result<Option<PermissionGrant>, ApiError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT r.content FROM record r
            JOIN stream s ON s.id = r.stream_id
            WHERE s.pod_name = $1 AND s.path = $2
              AND r.name = $3 AND NOT r.deleted AND NOT r.purged
            ORDER BY r.record_index DESC
            LIMIT 1
            "#,
        )
        .bind(pod)
        .bind(permission_path)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.and_then(|(content,)| serde_json::from_slice(&content).ok()))
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Stream>, ApiError> {
        let stream = sqlx::query_as::<_, Stream>("SELECT * FROM stream WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(stream)
    }
}
