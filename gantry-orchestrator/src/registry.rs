//! Container image registry interface
//!
//! Execution environments that publish or fetch images do so through an
//! [`ImageRegistry`]. Stage code only ever sees an [`AuthorizedRegistry`],
//! which asks the stage's [`Authorizer`] before every call, so an image push
//! from a stage granted only `registry:pull` never reaches the registry.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use gantry_core::{Authorizer, PermissionDenied};

pub const PULL_ACTION: &str = "registry:pull";
pub const PUSH_ACTION: &str = "registry:push";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionDenied),

    #[error("image {repository}:{tag} not found")]
    NotFound { repository: String, tag: String },

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Push an image, returning its digest
    async fn push(&self, repository: &str, tag: &str, image: Vec<u8>) -> Result<String, RegistryError>;

    async fn pull(&self, repository: &str, tag: &str) -> Result<Vec<u8>, RegistryError>;
}

/// Resource name the permission model uses for a repository
pub fn repository_resource(repository: &str) -> String {
    format!("registry/{}", repository)
}

/// Registry wrapper enforcing one executor's grants
pub struct AuthorizedRegistry<R> {
    inner: R,
    authorizer: Authorizer,
}

impl<R: ImageRegistry> AuthorizedRegistry<R> {
    pub fn new(inner: R, authorizer: Authorizer) -> Self {
        Self { inner, authorizer }
    }
}

#[async_trait]
impl<R: ImageRegistry> ImageRegistry for AuthorizedRegistry<R> {
    async fn push(&self, repository: &str, tag: &str, image: Vec<u8>) -> Result<String, RegistryError> {
        self.authorizer
            .check(PUSH_ACTION, &repository_resource(repository))?;
        self.inner.push(repository, tag, image).await
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<Vec<u8>, RegistryError> {
        self.authorizer
            .check(PULL_ACTION, &repository_resource(repository))?;
        self.inner.pull(repository, tag).await
    }
}

#[async_trait]
impl<R: ImageRegistry + ?Sized> ImageRegistry for std::sync::Arc<R> {
    async fn push(&self, repository: &str, tag: &str, image: Vec<u8>) -> Result<String, RegistryError> {
        (**self).push(repository, tag, image).await
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<Vec<u8>, RegistryError> {
        (**self).pull(repository, tag).await
    }
}

/// Registry held in memory, used by local and scripted environments
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    images: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, repository: &str, tag: &str) -> bool {
        self.images
            .read()
            .map(|images| images.contains_key(&(repository.to_string(), tag.to_string())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn push(&self, repository: &str, tag: &str, image: Vec<u8>) -> Result<String, RegistryError> {
        let digest = crate::artifact::digest(&image);
        let mut images = self
            .images
            .write()
            .map_err(|_| RegistryError::Unavailable("lock poisoned".to_string()))?;
        images.insert((repository.to_string(), tag.to_string()), image);
        Ok(digest)
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<Vec<u8>, RegistryError> {
        let images = self
            .images
            .read()
            .map_err(|_| RegistryError::Unavailable("lock poisoned".to_string()))?;
        images
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            })
    }
}
