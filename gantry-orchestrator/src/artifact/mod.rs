//! Artifact Store
//!
//! Content-addressable registry of named, run-scoped build outputs. An
//! artifact is addressed by its [`ArtifactRef`] (run, producing stage, name)
//! and identified by the sha256 digest of its content. Content is immutable
//! once stored and is only removed when its run is retired.

mod memory;
mod postgres;

pub use memory::MemoryArtifactStore;
pub use postgres::PgArtifactStore;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use gantry_core::ErrorKind;
use gantry_core::domain::artifact::{Artifact, ArtifactRef};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} already exists")]
    Duplicate(ArtifactRef),

    #[error("artifact {0} not found")]
    NotFound(ArtifactRef),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("artifact storage error: {0}")]
    Storage(String),
}

impl ArtifactError {
    /// Run failure tag for errors that are a property of the run rather
    /// than of the storage backend
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ArtifactError::Duplicate(_) => Some(ErrorKind::DuplicateArtifact),
            ArtifactError::NotFound(_) => Some(ErrorKind::UnresolvedArtifact),
            ArtifactError::Database(_) | ArtifactError::Storage(_) => None,
        }
    }
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `content` under (run, stage, name).
    ///
    /// Fails with [`ArtifactError::Duplicate`] if the ref already exists;
    /// stored content is never replaced.
    async fn put(
        &self,
        run_id: Uuid,
        stage: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ArtifactResult<ArtifactRef>;

    /// Full content of a committed artifact, never a partial result
    async fn get(&self, reference: &ArtifactRef) -> ArtifactResult<Vec<u8>>;

    async fn metadata(&self, reference: &ArtifactRef) -> ArtifactResult<Artifact>;

    /// Every artifact committed for `run_id`
    async fn list(&self, run_id: Uuid) -> ArtifactResult<Vec<Artifact>>;

    /// Delete a retired run's artifacts, returning how many were removed
    async fn purge_run(&self, run_id: Uuid) -> ArtifactResult<usize>;

    async fn contains(&self, reference: &ArtifactRef) -> ArtifactResult<bool> {
        match self.metadata(reference).await {
            Ok(_) => Ok(true),
            Err(ArtifactError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Hex-encoded sha256 of `content`
pub fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest() {
        assert_eq!(
            digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest(b"image").len(), 64);
    }

    #[test]
    fn test_error_kinds() {
        let reference = ArtifactRef::new(Uuid::new_v4(), "build", "image");
        assert_eq!(
            ArtifactError::Duplicate(reference.clone()).kind(),
            Some(ErrorKind::DuplicateArtifact)
        );
        assert_eq!(
            ArtifactError::NotFound(reference).kind(),
            Some(ErrorKind::UnresolvedArtifact)
        );
        assert_eq!(ArtifactError::Storage("disk".to_string()).kind(), None);
    }
}
