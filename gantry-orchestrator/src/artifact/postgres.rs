//! PostgreSQL artifact store.
//!
//! Blobs are keyed by digest and shared between refs, so identical content
//! produced by many runs is stored once. A ref and its blob are written in
//! one transaction; a ref is never visible without its content.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use gantry_core::domain::artifact::{Artifact, ArtifactRef};

use super::{ArtifactError, ArtifactResult, ArtifactStore, digest};

#[derive(Clone)]
pub struct PgArtifactStore {
    pool: PgPool,
}

impl PgArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactStore for PgArtifactStore {
    async fn put(
        &self,
        run_id: Uuid,
        stage: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ArtifactResult<ArtifactRef> {
        let reference = ArtifactRef::new(run_id, stage, name);
        let digest = digest(&content);
        let size = content.len() as i64;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO artifact_blobs (digest, content, size, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (digest) DO NOTHING
            "#,
        )
        .bind(&digest)
        .bind(&content)
        .bind(size)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO artifacts (run_id, stage, name, digest, size, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run_id)
        .bind(stage)
        .bind(name)
        .bind(&digest)
        .bind(size)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(ArtifactError::Duplicate(reference));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;

        tracing::debug!("Stored artifact {} ({} bytes, sha256 {})", reference, size, digest);
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> ArtifactResult<Vec<u8>> {
        let content: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT b.content
            FROM artifacts a
            JOIN artifact_blobs b ON b.digest = a.digest
            WHERE a.run_id = $1 AND a.stage = $2 AND a.name = $3
            "#,
        )
        .bind(reference.run_id)
        .bind(&reference.stage)
        .bind(&reference.name)
        .fetch_optional(&self.pool)
        .await?;

        content.ok_or_else(|| ArtifactError::NotFound(reference.clone()))
    }

    async fn metadata(&self, reference: &ArtifactRef) -> ArtifactResult<Artifact> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT run_id, stage, name, digest, size, created_at
            FROM artifacts
            WHERE run_id = $1 AND stage = $2 AND name = $3
            "#,
        )
        .bind(reference.run_id)
        .bind(&reference.stage)
        .bind(&reference.name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| ArtifactError::NotFound(reference.clone()))
    }

    async fn list(&self, run_id: Uuid) -> ArtifactResult<Vec<Artifact>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT run_id, stage, name, digest, size, created_at
            FROM artifacts
            WHERE run_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn purge_run(&self, run_id: Uuid) -> ArtifactResult<usize> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM artifacts WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // Blobs no longer referenced by any run
        sqlx::query(
            r#"
            DELETE FROM artifact_blobs b
            WHERE NOT EXISTS (SELECT 1 FROM artifacts a WHERE a.digest = b.digest)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(removed as usize)
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    run_id: Uuid,
    stage: String,
    name: String,
    digest: String,
    size: i64,
    created_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            reference: ArtifactRef::new(row.run_id, row.stage, row.name),
            digest: row.digest,
            size: row.size as u64,
            created_at: row.created_at,
        }
    }
}
