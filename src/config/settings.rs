use super::DatabaseConfig;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Apex domain; `<pod>.<main_domain>` hosts address pods.
    pub main_domain: String,
    /// Pod served for hosts that match nothing else.
    pub root_pod: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub root: String,
    pub cdn_base: Option<String>,
    /// Content above this size is offloaded to the blob store.
    pub external_threshold: usize,
    /// Hard cap on record content size.
    pub max_payload_size: usize,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub adapter: RateLimitAdapter,
    pub read: u32,
    pub write: u32,
    pub pod_create: u32,
    pub stream_create: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAdapter {
    Sql,
    InMemory,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAdapterKind {
    InMemory,
    Redis,
    None,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub adapter: CacheAdapterKind,
    pub max_entries: usize,
    pub pod_ttl_secs: u64,
    pub stream_ttl_secs: u64,
    pub record_ttl_secs: u64,
    pub list_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Cap on list/range result sizes.
    pub max_record_limit: i64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub domain: DomainConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub blob: BlobConfig,
    pub rate_limits: RateLimitConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn new() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: env_or("PORT", 3000),
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },
            domain: DomainConfig {
                main_domain: std::env::var("MAIN_DOMAIN")
                    .unwrap_or_else(|_| "localhost".to_string()),
                root_pod: std::env::var("ROOT_POD").ok().filter(|s| !s.is_empty()),
            },
            auth: AuthConfig {
                jwt_secret: std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 5),
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            },
            blob: BlobConfig {
                root: std::env::var("BLOB_ROOT").unwrap_or_else(|_| "./blobs".to_string()),
                cdn_base: std::env::var("EXTERNAL_CDN_BASE")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim_end_matches('/').to_string()),
                external_threshold: env_or("EXTERNAL_THRESHOLD", 1048576), // 1 MiB
                max_payload_size: env_or("MAX_PAYLOAD_SIZE", 10485760),    // 10 MiB
            },
            rate_limits: RateLimitConfig {
                adapter: match std::env::var("RATE_LIMIT_ADAPTER").as_deref() {
                    Ok("in-memory") => RateLimitAdapter::InMemory,
                    Ok("none") => RateLimitAdapter::None,
                    _ => RateLimitAdapter::Sql,
                },
                read: env_or("RATE_LIMIT_READ", 10000),
                write: env_or("RATE_LIMIT_WRITE", 1000),
                pod_create: env_or("RATE_LIMIT_POD_CREATE", 10),
                stream_create: env_or("RATE_LIMIT_STREAM_CREATE", 100),
            },
            cache: CacheConfig {
                adapter: match std::env::var("CACHE_ADAPTER").as_deref() {
                    Ok("redis") => CacheAdapterKind::Redis,
                    Ok("none") => CacheAdapterKind::None,
                    _ => CacheAdapterKind::InMemory,
                },
                max_entries: env_or("CACHE_MAX_ENTRIES", 10000),
                pod_ttl_secs: env_or("CACHE_POD_TTL", 300),
                stream_ttl_secs: env_or("CACHE_STREAM_TTL", 300),
                record_ttl_secs: env_or("CACHE_RECORD_TTL", 60),
                list_ttl_secs: env_or("CACHE_LIST_TTL", 30),
            },
            query: QueryConfig {
                max_record_limit: env_or("MAX_RECORD_LIMIT", 1000),
            },
        })
    }
}
