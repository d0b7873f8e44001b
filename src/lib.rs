use std::sync::Arc;

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

use config::Settings;
use services::{BlobService, CacheService, RateLimitService, SchemaValidator};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub settings: Arc<Settings>,
    pub cache: CacheService,
    pub blob: Arc<BlobService>,
    pub rate_limiter: Arc<RateLimitService>,
    pub schema_validator: Arc<dyn SchemaValidator>,
}
