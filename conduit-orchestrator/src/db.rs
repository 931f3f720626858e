use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id UUID PRIMARY KEY,
            template_id VARCHAR(255),
            repository TEXT NOT NULL,
            branch TEXT NOT NULL,
            environment VARCHAR(255) NOT NULL,
            pipeline_type VARCHAR(100) NOT NULL,
            config JSONB NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{}',
            priority INTEGER NOT NULL,
            provider_preference VARCHAR(255),
            provider VARCHAR(255),
            provider_ref TEXT,
            state VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            queued_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            failure_category VARCHAR(50),
            failure_reason TEXT,
            dispatch_attempts INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create stage log table; rows are only ever appended
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_stages (
            seq BIGSERIAL PRIMARY KEY,
            execution_id UUID NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            state VARCHAR(50) NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            duration_ms BIGINT,
            recorded_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create provider health audit table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_health (
            id BIGSERIAL PRIMARY KEY,
            provider VARCHAR(255) NOT NULL,
            healthy BOOLEAN NOT NULL,
            details TEXT,
            status VARCHAR(50) NOT NULL,
            connection VARCHAR(50) NOT NULL,
            checked_at TIMESTAMPTZ NOT NULL,
            response_time_ms BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for listing, recovery and statistics queries
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_executions_created_at ON executions(created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_provider ON executions(provider)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_execution_stages_execution ON execution_stages(execution_id, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_provider_health_checked ON provider_health(provider, checked_at DESC)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
