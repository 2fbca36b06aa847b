//! Artifact retention
//!
//! Terminal runs older than the retention window are retired: their
//! artifacts are purged and the run is flagged so it is not swept again.
//! The run record itself is kept for auditing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::store::{RunStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

pub struct RetentionSweeper {
    store: Arc<dyn RunStore>,
    artifacts: Arc<dyn ArtifactStore>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn RunStore>,
        artifacts: Arc<dyn ArtifactStore>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            retention,
            interval,
        }
    }

    /// Retire every run past the retention window, returning how many
    pub async fn sweep_once(&self) -> Result<usize, RetentionError> {
        let window = chrono::Duration::from_std(self.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let runs = self.store.list_retirable_runs(cutoff).await?;
        let mut retired = 0;

        for mut run in runs {
            let purged = self.artifacts.purge_run(run.id).await?;
            run.retired = true;
            self.store.save_run(&run).await?;

            debug!(run_id = %run.id, "Retired run, purged {} artifact(s)", purged);
            retired += 1;
        }

        if retired > 0 {
            info!("Retention sweep retired {} run(s)", retired);
        }
        Ok(retired)
    }

    /// Sweep every `interval` until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Retention sweeper started (window {:?}, every {:?})",
            self.retention, self.interval
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                error!("Retention sweep failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Retention sweeper stopped");
    }
}
