#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Initialize database tables if they don't exist.
pub async fn init_tables(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    tracing::info!("Checking and creating database tables...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pod (
            name varchar(63) NOT NULL PRIMARY KEY,
            created_at timestamptz NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream (
            id varchar(36) NOT NULL PRIMARY KEY,
            pod_name varchar(63) NOT NULL REFERENCES pod(name) ON DELETE CASCADE,
            parent_id varchar(36) REFERENCES stream(id) ON DELETE CASCADE,
            name varchar(255) NOT NULL,
            path text NOT NULL,
            user_id varchar(255) NOT NULL,
            access_permission varchar(255) NOT NULL DEFAULT 'public',
            metadata jsonb,
            has_schema boolean NOT NULL DEFAULT false,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Root streams have a NULL parent; COALESCE keeps the sibling-name
    // uniqueness constraint effective for them too.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS stream_pod_parent_name_key
        ON stream (pod_name, COALESCE(parent_id, ''), name)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS stream_pod_path_key
        ON stream (pod_name, path)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record (
            id varchar(36) NOT NULL PRIMARY KEY,
            stream_id varchar(36) NOT NULL REFERENCES stream(id) ON DELETE CASCADE,
            record_index bigint NOT NULL,
            name varchar(255) NOT NULL,
            path text NOT NULL,
            content bytea NOT NULL,
            content_type varchar(255) NOT NULL,
            size bigint NOT NULL,
            content_hash varchar(64) NOT NULL,
            hash varchar(64) NOT NULL,
            previous_hash varchar(64),
            user_id varchar(255) NOT NULL,
            headers jsonb,
            deleted boolean NOT NULL DEFAULT false,
            purged boolean NOT NULL DEFAULT false,
            storage varchar(255),
            created_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (stream_id, record_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS record_stream_name_idx
        ON record (stream_id, name, record_index DESC)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limit (
            identifier varchar(255) NOT NULL,
            action varchar(32) NOT NULL,
            count integer NOT NULL DEFAULT 0,
            window_start timestamptz NOT NULL,
            window_end timestamptz NOT NULL,
            PRIMARY KEY (identifier, action, window_start)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables ready");

    Ok(())
}
