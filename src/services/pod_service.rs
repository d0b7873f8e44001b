use sqlx::PgPool;

use crate::{
    error::ApiError,
    models::{
        permission::OwnerRecord,
        pod::Pod,
        rate_limit::{RateLimitAction, RateLimitOutcome},
    },
    services::{
        cache_service::{keys, CachePool, CacheService},
        rate_limit_service::RateLimitService,
        record_service::{append_in_tx, AppendSpec},
        stream_service::create_hierarchy,
    },
    utils::validation::is_valid_pod_name,
};

pub struct PodService {
    db: PgPool,
    cache: CacheService,
}

impl PodService {
    pub fn new(db: PgPool, cache: CacheService) -> Self {
        Self { db, cache }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Pod>, ApiError> {
        let key = keys::pod(name);
        if let Some(pod) = self.cache.get::<Pod>(CachePool::Pods, &key).await {
            return Ok(Some(pod));
        }
        let pod = sqlx::query_as::<_, Pod>("SELECT * FROM pod WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        if let Some(p) = &pod {
            self.cache.set(CachePool::Pods, &key, p).await;
        }
        Ok(pod)
    }

    /// Create a pod and seed its ownership: the pod row, the
    /// `.config/owner` stream, and the first `owner` record share one
    /// transaction with the `pod_create` debit.
    pub async fn create(
        &self,
        name: &str,
        user_id: &str,
        rate: &RateLimitService,
        identifier: &str,
    ) -> Result<(Pod, RateLimitOutcome), ApiError> {
        if !is_valid_pod_name(name) {
            return Err(ApiError::InvalidPodId(name.to_string()));
        }
        if self.get(name).await?.is_some() {
            return Err(ApiError::PodExists(name.to_string()));
        }

        let mut tx = self.db.begin().await?;
        let outcome = rate
            .debit_in_tx(&mut tx, identifier, RateLimitAction::PodCreate)
            .await?;

        let pod = sqlx::query_as::<_, Pod>(
            "INSERT INTO pod (name) VALUES ($1) ON CONFLICT DO NOTHING RETURNING *",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ApiError::PodExists(name.to_string()))?;

        let owner_stream =
            create_hierarchy(&mut tx, name, &[".config", "owner"], user_id, None, false).await?;

        let owner_content = serde_json::to_vec(&OwnerRecord {
            owner: user_id.to_string(),
        })
        .map_err(|_| ApiError::Internal)?;

        append_in_tx(
            &mut tx,
            &owner_stream,
            AppendSpec {
                name: "owner",
                content: &owner_content,
                content_type: "application/json",
                headers: None,
                user_id,
                storage: None,
                deleted: false,
            },
        )
        .await?;

        tx.commit().await?;

        tracing::info!(pod = name, owner = user_id, "pod created");

        Ok((pod, outcome))
    }

    /// Pods whose latest `.config/owner` record names this user.
    pub async fn list_owned(&self, user_id: &str) -> Result<Vec<Pod>, ApiError> {
        let pods = sqlx::query_as::<_, Pod>(
            r#"
            SELECT p.* FROM pod p
            JOIN stream s ON s.pod_name = p.name AND s.path = '.config/owner'
            JOIN LATERAL (
                SELECT r.content FROM record r
                WHERE r.stream_id = s.id AND r.name = 'owner'
                  AND NOT r.deleted AND NOT r.purged
                ORDER BY r.record_index DESC
                LIMIT 1
            ) o ON true
            WHERE convert_from(o.content, 'UTF8')::jsonb->>'owner' = $1
            ORDER BY p.name ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(pods)
    }

    /// Delete the pod row; streams and records cascade. The caller removes
    /// blob-store state afterwards.
    pub async fn delete(&self, name: &str) -> Result<(), ApiError> {
        let result = sqlx::query("DELETE FROM pod WHERE name = $1")
            .bind(name)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::PodNotFound(name.to_string()));
        }

        self.cache.invalidate_pod(name).await;

        tracing::info!(pod = name, "pod deleted");

        Ok(())
    }

    /// Map a custom domain to a pod via `.config/domains` records (record
    /// name = domain, latest non-deleted record wins).
    pub async fn find_by_domain(&self, host: &str) -> Result<Option<String>, ApiError> {
        let db = self.db.clone();
        let host_owned = host.to_string();
        let pod = self
            .cache
            .get_or_set(CachePool::Pods, &keys::domain(host), move || async move {
                let row: Option<(String,)> = sqlx::query_as(
                    r#"
                    SELECT s.pod_name FROM record r
                    JOIN stream s ON s.id = r.stream_id
                    WHERE s.path = '.config/domains' AND r.name = $1
                      AND NOT r.deleted AND NOT r.purged
                    ORDER BY r.record_index DESC
                    LIMIT 1
                    "#,
                )
                .bind(&host_owned)
                .fetch_optional(&db)
                .await?;
                Ok(row.map(|(pod,)| pod))
            })
            .await?;
        Ok(pod)
    }

    /// Root routing table: the latest `routing` record in
    /// `.config/routing`, a JSON object mapping paths to
    /// `streamPath/recordName` targets.
    pub async fn routing(&self, pod: &str) -> Result<Option<serde_json::Value>, ApiError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT r.content FROM record r
            JOIN stream s ON s.id = r.stream_id
            WHERE s.pod_name = $1 AND s.path = '.config/routing'
              AND r.name = 'routing' AND NOT r.deleted AND NOT r.purged
            ORDER BY r.record_index DESC
            LIMIT 1
            "#,
        )
        .bind(pod)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.and_then(|(content,)| serde_json::from_slice(&content).ok()))
    }
}
