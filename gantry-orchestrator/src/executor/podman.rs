//! Podman execution environment
//!
//! Each attempt runs in a fresh `podman run --rm` container with a private
//! workspace mounted at `/workspace`:
//! - `inputs/<name>` holds every resolved input artifact
//! - the stage writes each declared output to `outputs/<name>`
//!
//! The workspace is removed once the attempt finishes. The stage image is
//! pulled through an [`AuthorizedRegistry`] first, so a stage without
//! `registry:pull` on the image's repository never starts a container.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::domain::log::LogEntry;

use super::{EnvironmentError, ExecutionEnvironment, ExecutionOutcome, ExecutionRequest};
use crate::registry::{AuthorizedRegistry, ImageRegistry, RegistryError};

/// Exit code podman itself uses when it cannot run the container
const PODMAN_ERROR_EXIT: i32 = 125;

const CONTAINER_WORKSPACE: &str = "/workspace";

/// Checks if podman is installed and available
pub fn check_podman_available(binary: &str) -> Result<()> {
    let output = std::process::Command::new(binary)
        .arg("--version")
        .output()
        .with_context(|| format!("Failed to execute '{} --version'. Is podman installed?", binary))?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

pub struct PodmanEnvironment {
    workspace_root: PathBuf,
    binary: String,
}

impl PodmanEnvironment {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            binary: "podman".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn check_available(&self) -> Result<()> {
        check_podman_available(&self.binary)
    }

    /// Pull the stage image under the stage's own grants
    async fn pull_image(&self, request: &ExecutionRequest) -> Result<(), EnvironmentError> {
        let (repository, tag) = split_image(&request.config.image);
        let registry =
            AuthorizedRegistry::new(PodmanRegistry::new(&self.binary), request.authorizer.clone());

        match registry.pull(repository, tag).await {
            Ok(_) => {
                debug!("Pulled image {} for stage {}", request.config.image, request.stage);
                Ok(())
            }
            Err(RegistryError::PermissionDenied(denied)) => {
                Err(EnvironmentError::PermissionDenied(denied))
            }
            Err(e) => Err(EnvironmentError::Unavailable(e.to_string())),
        }
    }

    fn workspace_path(&self, request: &ExecutionRequest) -> PathBuf {
        self.workspace_root
            .join(request.run_id.to_string())
            .join(format!("{}-{}", sanitize(&request.stage), request.attempt))
    }

    /// Create the attempt's workspace and write its inputs
    async fn prepare_workspace(&self, request: &ExecutionRequest) -> std::io::Result<PathBuf> {
        let workspace = self.workspace_path(request);
        if tokio::fs::try_exists(&workspace).await? {
            tokio::fs::remove_dir_all(&workspace).await?;
        }

        let inputs = workspace.join("inputs");
        tokio::fs::create_dir_all(&inputs).await?;
        tokio::fs::create_dir_all(workspace.join("outputs")).await?;

        for (name, content) in &request.inputs {
            tokio::fs::write(inputs.join(name), content).await?;
        }

        Ok(workspace)
    }

    fn podman_args(&self, request: &ExecutionRequest, workspace: &Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--pull=never".to_string(),
            "--name".to_string(),
            container_name(request),
            "-v".to_string(),
            format!("{}:{}", workspace.display(), CONTAINER_WORKSPACE),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
        ];

        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if request.config.privileged {
            args.push("--privileged".to_string());
        }

        args.push(request.config.image.clone());
        args.extend(request.config.command.iter().cloned());
        args
    }

    async fn stop_container(&self, name: &str) {
        match Command::new(&self.binary).arg("stop").arg(name).output().await {
            Ok(output) if output.status.success() => debug!("Container {} stopped", name),
            Ok(output) => warn!(
                "Failed to stop container {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to stop container {}: {}", name, e),
        }
    }

    async fn cleanup(&self, workspace: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            warn!("Failed to remove workspace {}: {}", workspace.display(), e);
        }
    }

    async fn run_container(
        &self,
        request: &ExecutionRequest,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, EnvironmentError> {
        let name = container_name(request);
        let mut child = Command::new(&self.binary)
            .args(self.podman_args(request, workspace))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EnvironmentError::Unavailable(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        info!(
            "Started container {} for stage {} (image {})",
            name, request.stage, request.config.image
        );

        let stdout = child.stdout.take().map(|out| tokio::spawn(read_lines(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_lines(err)));

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            info!("Stopping container {}", name);
            self.stop_container(&name).await;
            let _ = child.kill().await;
            return Err(EnvironmentError::Cancelled);
        };

        let status = status.map_err(|e| {
            EnvironmentError::Unavailable(format!("failed to wait for container {}: {}", name, e))
        })?;

        let mut logs = Vec::new();
        if let Some(task) = stdout {
            logs.extend(task.await.unwrap_or_default().into_iter().map(LogEntry::info));
        }
        let mut stderr_lines = Vec::new();
        if let Some(task) = stderr {
            stderr_lines = task.await.unwrap_or_default();
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code == PODMAN_ERROR_EXIT {
            return Err(EnvironmentError::Unavailable(format!(
                "podman could not run {}: {}",
                request.config.image,
                stderr_lines.join("\n")
            )));
        }
        logs.extend(stderr_lines.into_iter().map(LogEntry::warning));

        let outputs = if exit_code == 0 {
            collect_outputs(&workspace.join("outputs"))
                .await
                .map_err(|e| EnvironmentError::Unavailable(format!("cannot read outputs: {}", e)))?
        } else {
            BTreeMap::new()
        };

        debug!(
            "Container {} exited with {} ({} output(s))",
            name,
            exit_code,
            outputs.len()
        );

        Ok(ExecutionOutcome {
            exit_code,
            logs,
            outputs,
        })
    }
}

#[async_trait]
impl ExecutionEnvironment for PodmanEnvironment {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, EnvironmentError> {
        self.pull_image(&request).await?;

        let workspace = self.prepare_workspace(&request).await.map_err(|e| {
            EnvironmentError::Unavailable(format!("cannot prepare workspace: {}", e))
        })?;

        let result = self.run_container(&request, &workspace, &cancel).await;
        self.cleanup(&workspace).await;
        result
    }
}

/// Image registry reached through the podman CLI
pub struct PodmanRegistry {
    binary: String,
}

impl PodmanRegistry {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn podman(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, RegistryError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RegistryError::Unavailable(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await.map_err(|e| {
                RegistryError::Unavailable(format!("failed to stream image to {}: {}", self.binary, e))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            RegistryError::Unavailable(format!("failed to wait for {}: {}", self.binary, e))
        })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(RegistryError::Unavailable(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl ImageRegistry for PodmanRegistry {
    /// Load the image archive, tag it and push it; returns the archive digest
    async fn push(&self, repository: &str, tag: &str, image: Vec<u8>) -> Result<String, RegistryError> {
        let digest = crate::artifact::digest(&image);
        let loaded = self.podman(&["load", "--quiet"], Some(image.as_slice())).await?;

        let loaded = String::from_utf8_lossy(&loaded);
        let source = loaded
            .lines()
            .find_map(|line| line.split_once(": ").map(|(_, name)| name.trim()))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RegistryError::Unavailable("podman load reported no image".to_string()))?;

        let target = image_reference(repository, tag);
        self.podman(&["tag", source, &target], None).await?;
        self.podman(&["push", &target], None).await?;

        info!("Pushed {} ({})", target, digest);
        Ok(digest)
    }

    /// Returns the local image id
    async fn pull(&self, repository: &str, tag: &str) -> Result<Vec<u8>, RegistryError> {
        let reference = image_reference(repository, tag);
        self.podman(&["pull", "--quiet", &reference], None)
            .await
            .map_err(|e| match e {
                RegistryError::Unavailable(reason) if is_missing_image(&reason) => {
                    RegistryError::NotFound {
                        repository: repository.to_string(),
                        tag: tag.to_string(),
                    }
                }
                other => other,
            })
    }
}

fn is_missing_image(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("manifest unknown") || reason.contains("not found")
}

/// Split an image into repository and tag, or repository and digest.
/// An untagged image means `latest`.
fn split_image(image: &str) -> (&str, &str) {
    if let Some((repository, digest)) = image.split_once('@') {
        return (repository, digest);
    }

    let name_start = image.rfind('/').map_or(0, |slash| slash + 1);
    match image[name_start..].rfind(':') {
        Some(colon) => (&image[..name_start + colon], &image[name_start + colon + 1..]),
        None => (image, "latest"),
    }
}

fn image_reference(repository: &str, tag: &str) -> String {
    if tag.contains(':') {
        format!("{}@{}", repository, tag)
    } else {
        format!("{}:{}", repository, tag)
    }
}

/// Every regular file in `dir`, keyed by file name
async fn collect_outputs(dir: &Path) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut outputs = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        outputs.insert(name, tokio::fs::read(entry.path()).await?);
    }

    Ok(outputs)
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected
}

fn container_name(request: &ExecutionRequest) -> String {
    format!(
        "gantry-{}-{}-{}",
        request.run_id,
        sanitize(&request.stage),
        request.attempt
    )
}

/// Lowercase alphanumerics and dashes only
fn sanitize(stage: &str) -> String {
    stage
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
