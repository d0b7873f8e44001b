use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::stream::Stream,
    services::cache_service::{keys, CachePool, CacheService},
    utils::validation::{is_system_stream_path, is_valid_stream_segment},
};

pub struct StreamService {
    db: PgPool,
    cache: CacheService,
}

/// What a URL path resolves to for read operations.
#[derive(Debug)]
pub enum ResolvedPath {
    /// The full path names an existing stream.
    Stream(Stream),
    /// The prefix names a stream and the final segment is a record name.
    Record { stream: Stream, name: String },
}

pub(crate) async fn fetch_by_path<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    pod: &str,
    path: &str,
) -> Result<Option<Stream>, sqlx::Error> {
    sqlx::query_as::<_, Stream>("SELECT * FROM stream WHERE pod_name = $1 AND path = $2")
        .bind(pod)
        .bind(path)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn child_stream_exists<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    parent_id: &str,
    name: &str,
) -> Result<bool, sqlx::Error> {
    let row: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM stream WHERE parent_id = $1 AND name = $2")
            .bind(parent_id)
            .bind(name)
            .fetch_optional(executor)
            .await?;
    Ok(row.is_some())
}

/// Create every missing node along `segments`, returning the leaf stream.
///
/// Streams under `.config` default to `private`; everything else defaults
/// to `public`. `explicit` makes an already-existing leaf an error
/// (stream-creation API semantics); lazy hierarchy creation tolerates it.
pub(crate) async fn create_hierarchy(
    tx: &mut Transaction<'_, Postgres>,
    pod: &str,
    segments: &[&str],
    user_id: &str,
    leaf_access: Option<&str>,
    explicit: bool,
) -> Result<Stream, ApiError> {
    if segments.is_empty() {
        return Err(ApiError::InvalidName("empty stream path".to_string()));
    }
    for (i, segment) in segments.iter().enumerate() {
        if !is_valid_stream_segment(segment) || (i > 0 && *segment == ".config") {
            return Err(ApiError::InvalidName(format!(
                "invalid stream segment '{}'",
                segment
            )));
        }
    }

    let default_access = if segments[0] == ".config" {
        "private"
    } else {
        "public"
    };

    let mut parent: Option<Stream> = None;
    let mut path = String::new();

    for (i, segment) in segments.iter().enumerate() {
        if path.is_empty() {
            path.push_str(segment);
        } else {
            path.push('/');
            path.push_str(segment);
        }
        let is_leaf = i == segments.len() - 1;

        if let Some(existing) = fetch_by_path(&mut **tx, pod, &path).await? {
            if is_leaf && explicit {
                return Err(ApiError::StreamAlreadyExists(path));
            }
            parent = Some(existing);
            continue;
        }

        // A record and a child stream cannot share a name under the same
        // parent: their materialized paths would collide.
        if let Some(p) = &parent {
            if record_name_exists(&mut **tx, &p.id, segment).await? {
                return Err(ApiError::NameConflict(format!(
                    "'{}' already names a record in '{}'",
                    segment, p.path
                )));
            }
        }

        let access = if is_leaf {
            leaf_access.unwrap_or(default_access)
        } else {
            default_access
        };

        // Concurrent writers may race to create the same node; the unique
        // index arbitrates and the loser re-reads.
        let inserted = sqlx::query_as::<_, Stream>(
            r#"
            INSERT INTO stream (id, pod_name, parent_id, name, path, user_id, access_permission)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(pod)
        .bind(parent.as_ref().map(|p| p.id.as_str()))
        .bind(segment)
        .bind(&path)
        .bind(user_id)
        .bind(access)
        .fetch_optional(&mut **tx)
        .await?;

        parent = match inserted {
            Some(s) => Some(s),
            None => {
                let existing = fetch_by_path(&mut **tx, pod, &path)
                    .await?
                    .ok_or(ApiError::Internal)?;
                Some(existing)
            }
        };
    }

    parent.ok_or(ApiError::Internal)
}

async fn record_name_exists<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    stream_id: &str,
    name: &str,
) -> Result<bool, sqlx::Error> {
    // Only a live name conflicts; a soft-deleted one has ceded the path.
    let row: Option<(bool,)> = sqlx::query_as(
        r#"
        SELECT deleted FROM record
        WHERE stream_id = $1 AND name = $2
        ORDER BY record_index DESC
        LIMIT 1
        "#,
    )
    .bind(stream_id)
    .bind(name)
    .fetch_optional(executor)
    .await?;
    Ok(matches!(row, Some((false,))))
}

impl StreamService {
    pub fn new(db: PgPool, cache: CacheService) -> Self {
        Self { db, cache }
    }

    /// Get a stream by its materialized path (cached).
    pub async fn get_by_path(&self, pod: &str, path: &str) -> Result<Option<Stream>, ApiError> {
        let key = keys::stream(pod, path);
        if let Some(stream) = self.cache.get::<Stream>(CachePool::Streams, &key).await {
            return Ok(Some(stream));
        }
        let stream = fetch_by_path(&self.db, pod, path).await?;
        if let Some(s) = &stream {
            self.cache.set(CachePool::Streams, &key, s).await;
        }
        Ok(stream)
    }

    /// Explicit stream creation (`POST /{stream...}` with an empty body).
    /// The `stream_create` debit shares the creation transaction.
    pub async fn create(
        &self,
        pod: &str,
        segments: &[&str],
        user_id: &str,
        access: Option<&str>,
        rate: &crate::services::rate_limit_service::RateLimitService,
        identifier: &str,
    ) -> Result<(Stream, crate::models::rate_limit::RateLimitOutcome), ApiError> {
        let mut tx = self.db.begin().await?;
        let outcome = rate
            .debit_in_tx(&mut tx, identifier, crate::models::rate_limit::RateLimitAction::StreamCreate)
            .await?;
        let stream = create_hierarchy(&mut tx, pod, segments, user_id, access, true).await?;
        tx.commit().await?;

        self.cache
            .invalidate_stream(pod, &stream.id, &stream.path)
            .await;

        tracing::info!(pod, path = %stream.path, "stream created");

        Ok((stream, outcome))
    }

    /// Ensure the hierarchy for a record write exists, creating missing
    /// nodes lazily inside the caller's transaction.
    pub async fn ensure_hierarchy(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        pod: &str,
        segments: &[&str],
        user_id: &str,
    ) -> Result<Stream, ApiError> {
        create_hierarchy(tx, pod, segments, user_id, None, false).await
    }

    /// Change a stream's access permission (empty-body POST with
    /// `?access=` on an existing stream).
    pub async fn update_access(&self, stream: &Stream, access: &str) -> Result<Stream, ApiError> {
        let updated = sqlx::query_as::<_, Stream>(
            r#"
            UPDATE stream SET access_permission = $1, updated_at = now()
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(access)
        .bind(&stream.id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| ApiError::StreamNotFound(stream.path.clone()))?;

        self.cache
            .invalidate_stream(&stream.pod_name, &stream.id, &stream.path)
            .await;

        tracing::info!(pod = %stream.pod_name, path = %stream.path, access, "stream access updated");

        Ok(updated)
    }

    /// All streams in a pod, path-ordered.
    pub async fn list(&self, pod: &str) -> Result<Vec<Stream>, ApiError> {
        let streams = sqlx::query_as::<_, Stream>(
            "SELECT * FROM stream WHERE pod_name = $1 ORDER BY path ASC",
        )
        .bind(pod)
        .fetch_all(&self.db)
        .await?;
        Ok(streams)
    }

    /// A stream and all its descendants, path-ordered (depth-first in a
    /// slash-ordered tree). Used by recursive listing, which bypasses the
    /// cache.
    pub async fn list_subtree(&self, pod: &str, path: &str) -> Result<Vec<Stream>, ApiError> {
        let streams = sqlx::query_as::<_, Stream>(
            r#"
            SELECT * FROM stream
            WHERE pod_name = $1 AND (path = $2 OR path LIKE $2 || '/%')
            ORDER BY path ASC
            "#,
        )
        .bind(pod)
        .bind(path)
        .fetch_all(&self.db)
        .await?;
        Ok(streams)
    }

    /// Longest existing prefix of `segments`, if any. Decides whose write
    /// permission governs creating new child streams.
    pub async fn nearest_ancestor(
        &self,
        pod: &str,
        segments: &[&str],
    ) -> Result<Option<Stream>, ApiError> {
        for len in (1..=segments.len()).rev() {
            let path = segments[..len].join("/");
            if let Some(s) = fetch_by_path(&self.db, pod, &path).await? {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    /// Delete a stream; records and child streams cascade. System streams
    /// are not deletable through the public path.
    pub async fn delete(&self, stream: &Stream) -> Result<(), ApiError> {
        if is_system_stream_path(&stream.path) {
            return Err(ApiError::Forbidden(
                "system streams cannot be deleted".to_string(),
            ));
        }
        sqlx::query("DELETE FROM stream WHERE id = $1")
            .bind(&stream.id)
            .execute(&self.db)
            .await?;

        self.cache
            .invalidate_stream(&stream.pod_name, &stream.id, &stream.path)
            .await;

        tracing::info!(pod = %stream.pod_name, path = %stream.path, "stream deleted");

        Ok(())
    }

    /// Resolve a read path: the full path as a stream first, otherwise the
    /// final segment is a record name within the prefix stream.
    pub async fn resolve_read_path(
        &self,
        pod: &str,
        segments: &[&str],
    ) -> Result<Option<ResolvedPath>, ApiError> {
        let full = segments.join("/");
        if let Some(stream) = self.get_by_path(pod, &full).await? {
            return Ok(Some(ResolvedPath::Stream(stream)));
        }
        let Some((name, prefix)) = segments.split_last() else {
            return Ok(None);
        };
        if prefix.is_empty() {
            return Ok(None);
        }
        let prefix_path = prefix.join("/");
        match self.get_by_path(pod, &prefix_path).await? {
            Some(stream) => Ok(Some(ResolvedPath::Record {
                stream,
                name: (*name).to_string(),
            })),
            None => Ok(None),
        }
    }
}
