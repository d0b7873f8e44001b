use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    config::Settings,
    error::ApiError,
    models::{
        rate_limit::{RateLimitAction, RateLimitOutcome},
        record::Record,
        stream::Stream,
    },
    services::{
        blob_service::{BlobService, STORAGE_TAG},
        cache_service::{keys, CachePool, CacheService},
        rate_limit_service::RateLimitService,
        schema_service::SchemaValidator,
        stream_service,
    },
    utils::{
        content::ResolvedContent,
        hash::{chain_hash, content_hash},
        validation::is_valid_record_name,
    },
};

/// Index query forms accepted by `?i=`: a single index (negative counts
/// from the end) or a half-open `start:end` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexQuery {
    Single(i64),
    Range(i64, i64),
}

pub fn parse_index_query(spec: &str) -> Result<IndexQuery, ApiError> {
    if let Some((a, b)) = spec.split_once(':') {
        let start = a
            .parse::<i64>()
            .map_err(|_| ApiError::InvalidIndex(format!("invalid range start '{}'", a)))?;
        let end = b
            .parse::<i64>()
            .map_err(|_| ApiError::InvalidIndex(format!("invalid range end '{}'", b)))?;
        return Ok(IndexQuery::Range(start, end));
    }
    spec.parse::<i64>()
        .map(IndexQuery::Single)
        .map_err(|_| ApiError::InvalidIndex(format!("invalid index '{}'", spec)))
}

/// Everything `append_in_tx` needs to materialize one log entry.
pub(crate) struct AppendSpec<'a> {
    pub name: &'a str,
    /// Logical content: always hashed, stored inline only when `storage`
    /// is `None`.
    pub content: &'a [u8],
    pub content_type: &'a str,
    pub headers: Option<&'a serde_json::Value>,
    pub user_id: &'a str,
    pub storage: Option<&'a str>,
    pub deleted: bool,
}

/// Append one record inside the caller's transaction.
///
/// Takes the stream row lock; this serializes all mutations of one stream
/// and is the sole guarantor of gapless indices and an unbroken chain.
pub(crate) async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    stream: &Stream,
    spec: AppendSpec<'_>,
) -> Result<Record, ApiError> {
    let locked: Option<(String,)> =
        sqlx::query_as("SELECT id FROM stream WHERE id = $1 FOR UPDATE")
            .bind(&stream.id)
            .fetch_optional(&mut **tx)
            .await?;
    if locked.is_none() {
        return Err(ApiError::StreamNotFound(stream.path.clone()));
    }

    // A record may not shadow a child stream: their materialized paths
    // would collide.
    if !spec.deleted
        && stream_service::child_stream_exists(&mut **tx, &stream.id, spec.name).await?
    {
        return Err(ApiError::NameConflict(format!(
            "'{}' already names a child stream of '{}'",
            spec.name, stream.path
        )));
    }

    let last: Option<(i64, String)> = sqlx::query_as(
        r#"
        SELECT record_index, hash FROM record
        WHERE stream_id = $1
        ORDER BY record_index DESC
        LIMIT 1
        "#,
    )
    .bind(&stream.id)
    .fetch_optional(&mut **tx)
    .await?;

    let (index, previous_hash) = match last {
        Some((i, h)) => (i + 1, Some(h)),
        None => (0, None),
    };

    let now = Utc::now();
    let content_hash = content_hash(spec.content);
    let hash = chain_hash(
        previous_hash.as_deref(),
        &content_hash,
        spec.user_id,
        now.timestamp_millis(),
    );

    let stored: &[u8] = if spec.storage.is_some() {
        &[]
    } else {
        spec.content
    };

    let record = sqlx::query_as::<_, Record>(
        r#"
        INSERT INTO record (
            id, stream_id, record_index, name, path, content, content_type,
            size, content_hash, hash, previous_hash, user_id, headers,
            deleted, purged, storage, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, false, $15, $16)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&stream.id)
    .bind(index)
    .bind(spec.name)
    .bind(format!("{}/{}", stream.path, spec.name))
    .bind(stored)
    .bind(spec.content_type)
    .bind(spec.content.len() as i64)
    .bind(&content_hash)
    .bind(&hash)
    .bind(previous_hash.as_deref())
    .bind(spec.user_id)
    .bind(spec.headers)
    .bind(spec.deleted)
    .bind(spec.storage)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;

    sqlx::query("UPDATE stream SET updated_at = $1 WHERE id = $2")
        .bind(now)
        .bind(&stream.id)
        .execute(&mut **tx)
        .await?;

    Ok(record)
}

/// Cached shape of a list query.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedList {
    records: Vec<Record>,
    total: i64,
}

pub struct RecordService {
    db: PgPool,
    cache: CacheService,
    blob: Arc<BlobService>,
    validator: Arc<dyn SchemaValidator>,
    external_threshold: usize,
    max_record_limit: i64,
}

impl RecordService {
    pub fn new(
        db: PgPool,
        cache: CacheService,
        blob: Arc<BlobService>,
        validator: Arc<dyn SchemaValidator>,
        settings: &Settings,
    ) -> Self {
        Self {
            db,
            cache,
            blob,
            validator,
            external_threshold: settings.blob.external_threshold,
            max_record_limit: settings.query.max_record_limit,
        }
    }

    fn clamp_limit(&self, limit: Option<i64>) -> i64 {
        limit
            .unwrap_or(self.max_record_limit)
            .clamp(1, self.max_record_limit)
    }

    /// Append a record. The `write` debit, the stream row lock, and the
    /// insert share one transaction; content above the external threshold
    /// is written to the blob store before the row commits.
    pub async fn append(
        &self,
        stream: &Stream,
        name: &str,
        content: ResolvedContent,
        headers: Option<serde_json::Value>,
        user_id: &str,
        rate: &RateLimitService,
        identifier: &str,
    ) -> Result<(Record, RateLimitOutcome), ApiError> {
        if !is_valid_record_name(name) {
            return Err(ApiError::InvalidName(format!(
                "invalid record name '{}'",
                name
            )));
        }

        if stream.has_schema {
            self.validator
                .validate(stream, &content.bytes, &content.content_type)
                .await
                .map_err(ApiError::ValidationError)?;
        }

        let mut tx = self.db.begin().await?;
        let outcome = rate
            .debit_in_tx(&mut tx, identifier, RateLimitAction::Write)
            .await?;

        // Blob write precedes the record commit; a failed commit unlinks it.
        let external = content.bytes.len() > self.external_threshold;
        let blob_hash = if external {
            let hash = content_hash(&content.bytes);
            self.blob
                .put(&stream.pod_name, &stream.path, name, &hash, &content.bytes)
                .await?;
            Some(hash)
        } else {
            None
        };

        let appended = async {
            let record = append_in_tx(
                &mut tx,
                stream,
                AppendSpec {
                    name,
                    content: &content.bytes,
                    content_type: &content.content_type,
                    headers: headers.as_ref(),
                    user_id,
                    storage: external.then_some(STORAGE_TAG),
                    deleted: false,
                },
            )
            .await?;
            tx.commit().await?;
            Ok::<Record, ApiError>(record)
        }
        .await;

        let record = match appended {
            Ok(record) => record,
            Err(e) => {
                if let Some(hash) = &blob_hash {
                    self.blob
                        .rollback(&stream.pod_name, &stream.path, name, hash)
                        .await;
                }
                return Err(e);
            }
        };

        self.invalidate_after_write(stream, name).await;

        tracing::debug!(
            pod = %stream.pod_name,
            path = %record.path,
            index = record.index,
            external,
            "record appended"
        );

        Ok((record, outcome))
    }

    /// Latest record for `name`, hiding deleted and purged entries.
    pub async fn get_by_name(
        &self,
        stream: &Stream,
        name: &str,
    ) -> Result<Option<Record>, ApiError> {
        let key = keys::record(&stream.pod_name, &stream.id, name);
        if let Some(record) = self.cache.get::<Record>(CachePool::SingleRecords, &key).await {
            return Ok(Some(record));
        }
        let record = self.latest_by_name(&stream.id, name).await?;
        match record {
            Some(r) if !r.deleted && !r.purged => {
                self.cache.set(CachePool::SingleRecords, &key, &r).await;
                Ok(Some(r))
            }
            _ => Ok(None),
        }
    }

    async fn latest_by_name(
        &self,
        stream_id: &str,
        name: &str,
    ) -> Result<Option<Record>, ApiError> {
        let record = sqlx::query_as::<_, Record>(
            r#"
            SELECT * FROM record
            WHERE stream_id = $1 AND name = $2
            ORDER BY record_index DESC
            LIMIT 1
            "#,
        )
        .bind(stream_id)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }

    pub async fn count(&self, stream_id: &str) -> Result<i64, ApiError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM record WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    /// Read one log entry by index. Negative indices count from the end
    /// (`-1` is the latest). Entries are returned as stored, deletion
    /// markers included.
    pub async fn get_by_index(&self, stream: &Stream, index: i64) -> Result<Record, ApiError> {
        let resolved = if index < 0 {
            let count = self.count(&stream.id).await?;
            count + index
        } else {
            index
        };
        if resolved < 0 {
            return Err(ApiError::RecordNotFound(format!(
                "index {} out of range",
                index
            )));
        }
        let record = sqlx::query_as::<_, Record>(
            "SELECT * FROM record WHERE stream_id = $1 AND record_index = $2",
        )
        .bind(&stream.id)
        .bind(resolved)
        .fetch_optional(&self.db)
        .await?;
        record.ok_or_else(|| ApiError::RecordNotFound(format!("index {} out of range", index)))
    }

    /// Read `[start, end)`, negatives resolved by count, capped at the
    /// configured maximum.
    pub async fn range(
        &self,
        stream: &Stream,
        start: i64,
        end: i64,
    ) -> Result<Vec<Record>, ApiError> {
        let count = self.count(&stream.id).await?;
        let resolve = |i: i64| if i < 0 { (count + i).max(0) } else { i };
        let start = resolve(start);
        let mut end = resolve(end).min(count);
        if end > start + self.max_record_limit {
            end = start + self.max_record_limit;
        }
        if start >= end {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, Record>(
            r#"
            SELECT * FROM record
            WHERE stream_id = $1 AND record_index >= $2 AND record_index < $3
            ORDER BY record_index ASC
            "#,
        )
        .bind(&stream.id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.db)
        .await?;
        Ok(records)
    }

    /// Index-ordered listing. `after` skips that many records; a negative
    /// value means "last N" (`after = max(0, count + after)`).
    pub async fn list(
        &self,
        stream: &Stream,
        limit: Option<i64>,
        after: Option<i64>,
    ) -> Result<(Vec<Record>, i64, bool), ApiError> {
        let limit = self.clamp_limit(limit);
        let total = self.count(&stream.id).await?;
        let offset = resolve_after(after, total);

        let key = keys::record_list(
            &stream.pod_name,
            &stream.id,
            &format!("list:{}:{}", offset, limit),
        );
        if let Some(cached) = self.cache.get::<CachedList>(CachePool::RecordLists, &key).await {
            let has_more = offset + (cached.records.len() as i64) < cached.total;
            return Ok((cached.records, cached.total, has_more));
        }

        let records = sqlx::query_as::<_, Record>(
            r#"
            SELECT * FROM record
            WHERE stream_id = $1
            ORDER BY record_index ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&stream.id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        self.cache
            .set(
                CachePool::RecordLists,
                &key,
                &CachedList {
                    records: records.clone(),
                    total,
                },
            )
            .await;

        let has_more = offset + (records.len() as i64) < total;
        Ok((records, total, has_more))
    }

    /// Latest non-deleted record per name, purged excluded, ordered by the
    /// winning record's index. `after`/`limit` apply to the unique set.
    pub async fn list_unique(
        &self,
        stream: &Stream,
        limit: Option<i64>,
        after: Option<i64>,
    ) -> Result<(Vec<Record>, i64, bool), ApiError> {
        let limit = self.clamp_limit(limit);
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT DISTINCT ON (name) deleted FROM record
                WHERE stream_id = $1 AND NOT purged
                ORDER BY name, record_index DESC
            ) latest WHERE NOT deleted
            "#,
        )
        .bind(&stream.id)
        .fetch_one(&self.db)
        .await?;
        let offset = resolve_after(after, total);

        let key = keys::record_list(
            &stream.pod_name,
            &stream.id,
            &format!("unique:{}:{}", offset, limit),
        );
        if let Some(cached) = self.cache.get::<CachedList>(CachePool::RecordLists, &key).await {
            let has_more = offset + (cached.records.len() as i64) < cached.total;
            return Ok((cached.records, cached.total, has_more));
        }

        let records = sqlx::query_as::<_, Record>(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (name) * FROM record
                WHERE stream_id = $1 AND NOT purged
                ORDER BY name, record_index DESC
            ) latest
            WHERE NOT deleted
            ORDER BY record_index ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&stream.id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        self.cache
            .set(
                CachePool::RecordLists,
                &key,
                &CachedList {
                    records: records.clone(),
                    total,
                },
            )
            .await;

        let has_more = offset + (records.len() as i64) < total;
        Ok((records, total, has_more))
    }

    /// Per-stream slice of a recursive listing. Bypasses the cache:
    /// hierarchical queries must re-check authority instead of trusting
    /// cached views.
    pub async fn list_for_recursive(
        &self,
        stream: &Stream,
        unique: bool,
        remaining: i64,
    ) -> Result<Vec<Record>, ApiError> {
        if remaining <= 0 {
            return Ok(Vec::new());
        }
        let records = if unique {
            sqlx::query_as::<_, Record>(
                r#"
                SELECT * FROM (
                    SELECT DISTINCT ON (name) * FROM record
                    WHERE stream_id = $1 AND NOT purged
                    ORDER BY name, record_index DESC
                ) latest
                WHERE NOT deleted
                ORDER BY record_index ASC
                LIMIT $2
                "#,
            )
            .bind(&stream.id)
            .bind(remaining)
            .fetch_all(&self.db)
            .await?
        } else {
            sqlx::query_as::<_, Record>(
                r#"
                SELECT * FROM record
                WHERE stream_id = $1
                ORDER BY record_index ASC
                LIMIT $2
                "#,
            )
            .bind(&stream.id)
            .bind(remaining)
            .fetch_all(&self.db)
            .await?
        };
        Ok(records)
    }

    /// Append a deletion marker hiding `name` from point reads. Idempotent:
    /// a second soft delete of the same name appends nothing.
    pub async fn soft_delete(
        &self,
        stream: &Stream,
        name: &str,
        user_id: &str,
        rate: &RateLimitService,
        identifier: &str,
    ) -> Result<(Option<Record>, RateLimitOutcome), ApiError> {
        let mut tx = self.db.begin().await?;
        let outcome = rate
            .debit_in_tx(&mut tx, identifier, RateLimitAction::Write)
            .await?;

        let locked: Option<(String,)> =
            sqlx::query_as("SELECT id FROM stream WHERE id = $1 FOR UPDATE")
                .bind(&stream.id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(ApiError::StreamNotFound(stream.path.clone()));
        }

        let latest: Option<Record> = sqlx::query_as(
            r#"
            SELECT * FROM record
            WHERE stream_id = $1 AND name = $2
            ORDER BY record_index DESC
            LIMIT 1
            "#,
        )
        .bind(&stream.id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(latest) = latest else {
            return Err(ApiError::RecordNotFound(format!(
                "{}/{}",
                stream.path, name
            )));
        };

        if latest.deleted {
            tx.commit().await?;
            return Ok((None, outcome));
        }

        let marker = append_in_tx(
            &mut tx,
            stream,
            AppendSpec {
                name,
                content: &[],
                content_type: "text/plain",
                headers: None,
                user_id,
                storage: None,
                deleted: true,
            },
        )
        .await?;
        tx.commit().await?;

        // The marker is committed; blob cleanup is best-effort.
        if latest.storage.as_deref() == Some(STORAGE_TAG) {
            if let Err(e) = self
                .blob
                .delete_name(&stream.pod_name, &stream.path, name)
                .await
            {
                tracing::warn!("blob name-link removal failed after soft delete: {}", e);
            }
        }

        self.invalidate_after_write(stream, name).await;

        tracing::debug!(pod = %stream.pod_name, path = %marker.path, "record soft-deleted");

        Ok((Some(marker), outcome))
    }

    /// Destroy the content of every record with `name` while keeping hash
    /// fields for chain continuity. Unlinks external blobs.
    pub async fn purge(
        &self,
        stream: &Stream,
        name: &str,
        _user_id: &str,
        rate: &RateLimitService,
        identifier: &str,
    ) -> Result<(u64, RateLimitOutcome), ApiError> {
        let mut tx = self.db.begin().await?;
        let outcome = rate
            .debit_in_tx(&mut tx, identifier, RateLimitAction::Write)
            .await?;

        let locked: Option<(String,)> =
            sqlx::query_as("SELECT id FROM stream WHERE id = $1 FOR UPDATE")
                .bind(&stream.id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(ApiError::StreamNotFound(stream.path.clone()));
        }

        let blobs: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT DISTINCT content_hash, storage FROM record
            WHERE stream_id = $1 AND name = $2
            "#,
        )
        .bind(&stream.id)
        .bind(name)
        .fetch_all(&mut *tx)
        .await?;

        if blobs.is_empty() {
            return Err(ApiError::RecordNotFound(format!(
                "{}/{}",
                stream.path, name
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE record
            SET content = $1, size = 0, purged = true
            WHERE stream_id = $2 AND name = $3
            "#,
        )
        .bind(&[] as &[u8])
        .bind(&stream.id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        // Rows are committed; blob destruction is best-effort from here.
        if let Err(e) = self
            .blob
            .delete_name(&stream.pod_name, &stream.path, name)
            .await
        {
            tracing::warn!("blob name-link removal failed after purge: {}", e);
        }
        for (hash, storage) in &blobs {
            if storage.as_deref() == Some(STORAGE_TAG) {
                if let Err(e) = self.blob.purge(&stream.pod_name, &stream.path, hash).await {
                    tracing::warn!("blob content removal failed after purge: {}", e);
                }
            }
        }

        self.invalidate_after_write(stream, name).await;

        tracing::info!(
            pod = %stream.pod_name,
            path = %stream.path,
            name,
            records = result.rows_affected(),
            "record purged"
        );

        Ok((result.rows_affected(), outcome))
    }

    /// Read external content for a record stored in the blob store.
    pub async fn external_content(
        &self,
        stream: &Stream,
        record: &Record,
    ) -> Result<Vec<u8>, ApiError> {
        self.blob
            .get(&stream.pod_name, &stream.path, &record.content_hash)
            .await
    }

    /// CDN redirect target for external content, when configured.
    pub fn external_url(&self, stream: &Stream, record: &Record) -> Option<String> {
        self.blob
            .public_url(&stream.pod_name, &stream.path, &record.content_hash)
    }

    async fn invalidate_after_write(&self, stream: &Stream, name: &str) {
        self.cache
            .invalidate_record(&stream.pod_name, &stream.id, name)
            .await;
        // Custom-domain mappings are data in `.config/domains`; their
        // derived cache entries follow the records.
        if stream.path == ".config/domains" {
            self.cache.delete(CachePool::Pods, &keys::domain(name)).await;
        }
    }
}

/// Resolve an `after` parameter to an offset over `total` ordered items.
fn resolve_after(after: Option<i64>, total: i64) -> i64 {
    match after {
        Some(a) if a < 0 => (total + a).max(0),
        Some(a) => a.min(total),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_query() {
        assert_eq!(parse_index_query("5").unwrap(), IndexQuery::Single(5));
        assert_eq!(parse_index_query("-1").unwrap(), IndexQuery::Single(-1));
        assert_eq!(parse_index_query("2:7").unwrap(), IndexQuery::Range(2, 7));
        assert_eq!(
            parse_index_query("-3:-1").unwrap(),
            IndexQuery::Range(-3, -1)
        );
        assert!(parse_index_query("abc").is_err());
        assert!(parse_index_query("1:b").is_err());
        assert!(parse_index_query("").is_err());
    }

    #[test]
    fn test_resolve_after_offsets() {
        // Positive values skip that many records.
        assert_eq!(resolve_after(Some(3), 10), 3);
        // Past the end clamps to the end (empty page, not an error).
        assert_eq!(resolve_after(Some(15), 10), 10);
        // Negative means "last N".
        assert_eq!(resolve_after(Some(-4), 10), 6);
        // More than exist: from the start.
        assert_eq!(resolve_after(Some(-20), 10), 0);
        assert_eq!(resolve_after(None, 10), 0);
    }
}
