//! In-memory artifact store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use gantry_core::domain::artifact::{Artifact, ArtifactRef};

use super::{ArtifactError, ArtifactResult, ArtifactStore, digest};

type RunArtifacts = BTreeMap<(String, String), (Artifact, Arc<Vec<u8>>)>;

/// Artifacts kept in process memory, partitioned per run.
///
/// The outer lock only guards the run lookup; every run's artifacts sit
/// behind their own mutex so runs never contend with each other.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunArtifacts>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, run_id: Uuid) -> ArtifactResult<Option<Arc<Mutex<RunArtifacts>>>> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs.get(&run_id).cloned())
    }

    fn run_or_insert(&self, run_id: Uuid) -> ArtifactResult<Arc<Mutex<RunArtifacts>>> {
        if let Some(run) = self.run(run_id)? {
            return Ok(run);
        }
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        Ok(runs.entry(run_id).or_default().clone())
    }

    fn lookup(&self, reference: &ArtifactRef) -> ArtifactResult<(Artifact, Arc<Vec<u8>>)> {
        let not_found = || ArtifactError::NotFound(reference.clone());

        let run = self.run(reference.run_id)?.ok_or_else(not_found)?;
        let artifacts = run.lock().map_err(|_| poisoned())?;
        artifacts
            .get(&(reference.stage.clone(), reference.name.clone()))
            .cloned()
            .ok_or_else(not_found)
    }
}

fn poisoned() -> ArtifactError {
    ArtifactError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        run_id: Uuid,
        stage: &str,
        name: &str,
        content: Vec<u8>,
    ) -> ArtifactResult<ArtifactRef> {
        let reference = ArtifactRef::new(run_id, stage, name);
        let run = self.run_or_insert(run_id)?;
        let mut artifacts = run.lock().map_err(|_| poisoned())?;

        let key = (stage.to_string(), name.to_string());
        if artifacts.contains_key(&key) {
            return Err(ArtifactError::Duplicate(reference));
        }

        let artifact = Artifact {
            reference: reference.clone(),
            digest: digest(&content),
            size: content.len() as u64,
            created_at: Utc::now(),
        };
        artifacts.insert(key, (artifact, Arc::new(content)));

        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> ArtifactResult<Vec<u8>> {
        let (_, content) = self.lookup(reference)?;
        Ok(content.as_ref().clone())
    }

    async fn metadata(&self, reference: &ArtifactRef) -> ArtifactResult<Artifact> {
        let (artifact, _) = self.lookup(reference)?;
        Ok(artifact)
    }

    async fn list(&self, run_id: Uuid) -> ArtifactResult<Vec<Artifact>> {
        let Some(run) = self.run(run_id)? else {
            return Ok(Vec::new());
        };
        let artifacts = run.lock().map_err(|_| poisoned())?;
        Ok(artifacts.values().map(|(a, _)| a.clone()).collect())
    }

    async fn purge_run(&self, run_id: Uuid) -> ArtifactResult<usize> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let Some(run) = runs.remove(&run_id) else {
            return Ok(0);
        };
        let artifacts = run.lock().map_err(|_| poisoned())?;
        Ok(artifacts.len())
    }
}
