pub mod database;
mod settings;

pub use database::DatabaseConfig;
pub use settings::{
    AuthConfig, BlobConfig, CacheAdapterKind, CacheConfig, DomainConfig, QueryConfig,
    RateLimitAdapter, RateLimitConfig, RedisConfig, ServerConfig, Settings,
};
