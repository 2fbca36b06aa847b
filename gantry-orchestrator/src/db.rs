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
    // Definition versions are immutable; (name, version) is the natural key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS definitions (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            version INTEGER NOT NULL,
            description TEXT,
            branch VARCHAR(255) NOT NULL,
            stages JSONB NOT NULL,
            approval_timeout_seconds BIGINT,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "ALTER TABLE definitions ADD COLUMN IF NOT EXISTS approval_timeout_seconds BIGINT",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            definition_id UUID NOT NULL REFERENCES definitions(id),
            definition_name VARCHAR(255) NOT NULL,
            definition JSONB NOT NULL,
            status VARCHAR(50) NOT NULL,
            current_stage INTEGER NOT NULL,
            trigger_event JSONB NOT NULL,
            stages JSONB NOT NULL,
            artifacts JSONB NOT NULL DEFAULT '[]',
            failure JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            retired BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Content is stored once per digest; refs stay run-scoped
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifact_blobs (
            digest TEXT PRIMARY KEY,
            content BYTEA NOT NULL,
            size BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            run_id UUID NOT NULL,
            stage VARCHAR(255) NOT NULL,
            name VARCHAR(255) NOT NULL,
            digest TEXT NOT NULL REFERENCES artifact_blobs(digest),
            size BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (run_id, stage, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS approval_decisions (
            run_id UUID NOT NULL,
            stage VARCHAR(255) NOT NULL,
            decision VARCHAR(20) NOT NULL,
            actor VARCHAR(255) NOT NULL,
            comment TEXT,
            expired BOOLEAN NOT NULL DEFAULT FALSE,
            decided_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (run_id, stage)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_definition_name ON runs(definition_name)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_artifacts_digest ON artifacts(digest)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
