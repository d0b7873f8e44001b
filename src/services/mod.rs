pub mod blob_service;
pub mod cache_service;
pub mod permission_service;
pub mod pod_service;
pub mod rate_limit_service;
pub mod record_service;
pub mod schema_service;
pub mod stream_service;

pub use blob_service::BlobService;
pub use cache_service::CacheService;
pub use permission_service::PermissionService;
pub use pod_service::PodService;
pub use rate_limit_service::RateLimitService;
pub use record_service::RecordService;
pub use schema_service::{NoopSchemaValidator, SchemaValidator};
pub use stream_service::StreamService;
