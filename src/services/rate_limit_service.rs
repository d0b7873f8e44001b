use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{RateLimitAdapter, RateLimitConfig};
use crate::error::ApiError;
use crate::models::rate_limit::{RateBucket, RateLimitAction, RateLimitOutcome};

const WINDOW_SECS: i64 = 3600;

/// Hourly window containing `now`, aligned on wall-clock hour boundaries.
pub fn window_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_secs = now.timestamp() - now.timestamp().rem_euclid(WINDOW_SECS);
    let start = Utc.timestamp_opt(start_secs, 0).unwrap();
    let end = Utc.timestamp_opt(start_secs + WINDOW_SECS, 0).unwrap();
    (start, end)
}

enum Backend {
    /// Buckets live in the `rate_limit` table; write-path debits join the
    /// caller's transaction so a committed cost always pairs with a
    /// committed effect.
    Sql(PgPool),
    /// Single-instance fallback, same fixed-window semantics.
    Memory(RwLock<HashMap<(String, &'static str), (i64, u32)>>),
    /// Admission always succeeds; headers still report the window.
    None,
}

pub struct RateLimitService {
    backend: Backend,
    limits: RateLimitConfig,
}

impl RateLimitService {
    pub fn new(config: RateLimitConfig, pool: PgPool) -> Arc<Self> {
        let backend = match config.adapter {
            RateLimitAdapter::Sql => Backend::Sql(pool),
            RateLimitAdapter::InMemory => Backend::Memory(RwLock::new(HashMap::new())),
            RateLimitAdapter::None => Backend::None,
        };
        Arc::new(Self {
            backend,
            limits: config,
        })
    }

    pub fn limit_for(&self, action: RateLimitAction) -> u32 {
        match action {
            RateLimitAction::Read => self.limits.read,
            RateLimitAction::Write => self.limits.write,
            RateLimitAction::PodCreate => self.limits.pod_create,
            RateLimitAction::StreamCreate => self.limits.stream_create,
        }
    }

    /// Debit one unit against the current window. Used for read-class
    /// actions where the debit does not need to join a transaction.
    pub async fn debit(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitOutcome, ApiError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Sql(pool) => {
                let bucket = debit_sql(pool, identifier, action, now).await?;
                self.gc_if_fresh(&bucket, now);
                self.outcome(action, bucket.count.max(0) as u32, now)
            }
            Backend::Memory(buckets) => {
                let count = debit_memory(buckets, identifier, action, now).await;
                self.outcome(action, count, now)
            }
            Backend::None => self.outcome(action, 0, now),
        }
    }

    /// Debit one unit inside the caller's transaction. A 429 (or any later
    /// failure of the transaction) rolls the increment back together with
    /// the write it was gating.
    pub async fn debit_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitOutcome, ApiError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Sql(_) => {
                let bucket = debit_sql(&mut **tx, identifier, action, now).await?;
                self.outcome(action, bucket.count.max(0) as u32, now)
            }
            Backend::Memory(buckets) => {
                let count = debit_memory(buckets, identifier, action, now).await;
                self.outcome(action, count, now)
            }
            Backend::None => self.outcome(action, 0, now),
        }
    }

    fn outcome(
        &self,
        action: RateLimitAction,
        count: u32,
        now: DateTime<Utc>,
    ) -> Result<RateLimitOutcome, ApiError> {
        let limit = self.limit_for(action);
        let (_, end) = window_bounds(now);
        if count > limit {
            return Err(ApiError::RateLimitExceeded {
                limit,
                reset: end.timestamp(),
            });
        }
        Ok(RateLimitOutcome {
            limit,
            remaining: limit.saturating_sub(count),
            reset: end.timestamp(),
        })
    }

    /// Expired buckets are garbage-collected opportunistically: the first
    /// debit of a fresh window sweeps old rows in the background.
    fn gc_if_fresh(&self, bucket: &RateBucket, now: DateTime<Utc>) {
        if bucket.count != 1 {
            return;
        }
        if let Backend::Sql(pool) = &self.backend {
            let pool = pool.clone();
            tokio::spawn(async move {
                if let Err(e) = sqlx::query("DELETE FROM rate_limit WHERE window_end < $1")
                    .bind(now)
                    .execute(&pool)
                    .await
                {
                    tracing::warn!("rate-limit bucket GC failed: {}", e);
                }
            });
        }
    }
}

async fn debit_sql<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    identifier: &str,
    action: RateLimitAction,
    now: DateTime<Utc>,
) -> Result<RateBucket, sqlx::Error> {
    let (start, end) = window_bounds(now);
    sqlx::query_as::<_, RateBucket>(
        r#"
        INSERT INTO rate_limit (identifier, action, count, window_start, window_end)
        VALUES ($1, $2, 1, $3, $4)
        ON CONFLICT (identifier, action, window_start)
        DO UPDATE SET count = rate_limit.count + 1
        RETURNING *
        "#,
    )
    .bind(identifier)
    .bind(action.as_str())
    .bind(start)
    .bind(end)
    .fetch_one(executor)
    .await
}

async fn debit_memory(
    buckets: &RwLock<HashMap<(String, &'static str), (i64, u32)>>,
    identifier: &str,
    action: RateLimitAction,
    now: DateTime<Utc>,
) -> u32 {
    let (start, _) = window_bounds(now);
    let start_secs = start.timestamp();
    let mut buckets = buckets.write().await;
    // All live buckets share the current wall-clock window; anything else
    // is expired.
    buckets.retain(|_, (s, _)| *s == start_secs);
    let entry = buckets
        .entry((identifier.to_string(), action.as_str()))
        .or_insert((start_secs, 0));
    entry.1 += 1;
    entry.1
}

impl RateLimitOutcome {
    /// Header triple attached to every rate-limited response.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds_aligned_to_hour() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 14, 37, 22).unwrap();
        let (start, end) = window_bounds(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_window_bounds_on_exact_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap();
        let (start, end) = window_bounds(now);
        assert_eq!(start, now);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_memory_buckets_count_within_window() {
        let buckets = RwLock::new(HashMap::new());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 14, 10, 0).unwrap();
        assert_eq!(debit_memory(&buckets, "u1", RateLimitAction::Write, now).await, 1);
        assert_eq!(debit_memory(&buckets, "u1", RateLimitAction::Write, now).await, 2);
        // Different identifier and action get independent buckets.
        assert_eq!(debit_memory(&buckets, "u2", RateLimitAction::Write, now).await, 1);
        assert_eq!(debit_memory(&buckets, "u1", RateLimitAction::Read, now).await, 1);
    }

    #[tokio::test]
    async fn test_memory_buckets_reset_across_windows() {
        let buckets = RwLock::new(HashMap::new());
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 14, 59, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 15, 1, 0).unwrap();
        assert_eq!(debit_memory(&buckets, "u1", RateLimitAction::Read, t1).await, 1);
        assert_eq!(debit_memory(&buckets, "u1", RateLimitAction::Read, t1).await, 2);
        assert_eq!(debit_memory(&buckets, "u1", RateLimitAction::Read, t2).await, 1);
    }

    #[test]
    fn test_outcome_429_above_limit() {
        let config = RateLimitConfig {
            adapter: RateLimitAdapter::None,
            read: 10000,
            write: 2,
            pod_create: 10,
            stream_create: 100,
        };
        let service = RateLimitService {
            backend: Backend::None,
            limits: config,
        };
        let now = Utc::now();
        assert!(service.outcome(RateLimitAction::Write, 2, now).is_ok());
        let err = service.outcome(RateLimitAction::Write, 3, now).unwrap_err();
        assert!(matches!(err, ApiError::RateLimitExceeded { limit: 2, .. }));
    }

    #[test]
    fn test_outcome_headers() {
        let outcome = RateLimitOutcome {
            limit: 1000,
            remaining: 997,
            reset: 1714575600,
        };
        let headers = outcome.headers();
        assert_eq!(headers[0], ("x-ratelimit-limit", "1000".to_string()));
        assert_eq!(headers[1], ("x-ratelimit-remaining", "997".to_string()));
        assert_eq!(headers[2], ("x-ratelimit-reset", "1714575600".to_string()));
    }
}
