use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webpods::config::{CacheAdapterKind, Settings};
use webpods::services::{
    cache_service::{CacheAdapter, InMemoryCacheAdapter, RedisCacheAdapter},
    BlobService, CacheService, NoopSchemaValidator, RateLimitService, SchemaValidator,
};
use webpods::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webpods=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Arc::new(Settings::new()?);

    tracing::info!("Starting WebPods server...");

    // Database connection pool
    let db = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .min_connections(settings.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;

    tracing::info!("Database connection established");

    // Initialize database tables
    webpods::config::database::init_tables(&db)
        .await
        .expect("Failed to initialize database tables");

    // Cache adapter
    let adapter: Option<Arc<dyn CacheAdapter>> = match settings.cache.adapter {
        CacheAdapterKind::InMemory => Some(Arc::new(InMemoryCacheAdapter::new(
            settings.cache.max_entries,
        ))),
        CacheAdapterKind::Redis => {
            let client = redis::Client::open(settings.redis.url.clone())?;
            let manager = client.get_connection_manager().await?;
            tracing::info!("Redis connection established");
            Some(Arc::new(RedisCacheAdapter::new(manager)))
        }
        CacheAdapterKind::None => None,
    };
    let cache = CacheService::new(adapter, settings.cache.clone());

    // Blob store
    let blob = Arc::new(BlobService::new(
        settings.blob.root.clone(),
        settings.blob.cdn_base.clone(),
    ));
    blob.ensure_root()
        .await
        .expect("Failed to create blob root directory");

    tracing::info!("Blob store initialized at {}", settings.blob.root);

    // Rate limiter
    let rate_limiter = RateLimitService::new(settings.rate_limits.clone(), db.clone());

    // Schema validation hook (external engine; accept-all by default)
    let schema_validator: Arc<dyn SchemaValidator> = Arc::new(NoopSchemaValidator);

    let state = AppState {
        db,
        settings: settings.clone(),
        cache,
        blob,
        rate_limiter,
        schema_validator,
    };

    // Pods are public HTTP APIs; reads come from arbitrary origins.
    let cors = CorsLayer::permissive();

    // Base64-encoded file bodies expand by 4/3 over the stored cap; the
    // transport limit leaves room and the content layer enforces the
    // exact cap on decoded bytes. Requests carry a deadline so a stuck
    // persistence call cannot pin a connection.
    let app = routes::build(state)
        .layer(RequestBodyLimitLayer::new(
            settings.blob.max_payload_size * 2,
        ))
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        "Server running on http://{} (main domain: {})",
        addr,
        settings.domain.main_domain
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
