use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Rate-limited action classes, each with its own hourly budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    Read,
    Write,
    PodCreate,
    StreamCreate,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Read => "read",
            RateLimitAction::Write => "write",
            RateLimitAction::PodCreate => "pod_create",
            RateLimitAction::StreamCreate => "stream_create",
        }
    }
}

impl std::fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-window counter row — matches the `rate_limit` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RateBucket {
    pub identifier: String,
    pub action: String,
    pub count: i32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Result of a successful debit, surfaced in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds of the window end.
    pub reset: i64,
}
