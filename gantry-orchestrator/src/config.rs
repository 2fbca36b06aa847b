//! Orchestrator configuration
//!
//! Every tunable the orchestrator uses: persistence, bind address, stage
//! retry and timeout policy, artifact retention and the operator-level
//! approver list.

use std::path::PathBuf;
use std::time::Duration;

use gantry_core::domain::permission::{APPROVAL_ACTION, PermissionGrant};
use gantry_core::GrantSet;
use gantry_core::permission::check_pattern;

use crate::executor::RetryPolicy;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string; in-memory stores are used when unset
    pub database_url: Option<String>,

    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Retry policy for transient execution environment failures
    pub retry: RetryPolicy,

    /// Default per-stage timeout, overridable per stage
    pub stage_timeout: Duration,

    /// How long a cancelled stage may take to stop before it is abandoned
    pub cancel_grace: Duration,

    /// Terminal runs older than this are retired and their artifacts purged
    pub retention: Duration,

    /// How often the retention sweeper runs
    pub sweep_interval: Duration,

    /// Root directory for per-stage container workspaces
    pub workspace: PathBuf,

    /// Operator-level approvers, applied to every gate they match
    pub approvers: Vec<PermissionGrant>,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DATABASE_URL
    /// - GANTRY_BIND_ADDR (default: 0.0.0.0:8080)
    /// - GANTRY_MAX_RETRIES (default: 3)
    /// - GANTRY_RETRY_INITIAL_MS (default: 500)
    /// - GANTRY_RETRY_MAX_MS (default: 30000)
    /// - GANTRY_STAGE_TIMEOUT (seconds, default: 3600)
    /// - GANTRY_CANCEL_GRACE (seconds, default: 30)
    /// - GANTRY_RETENTION_HOURS (default: 168)
    /// - GANTRY_SWEEP_INTERVAL (seconds, default: 300)
    /// - GANTRY_WORKSPACE (default: /tmp/gantry)
    /// - GANTRY_APPROVERS (comma-separated `actor=gate-pattern` pairs)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let approvers = match std::env::var("GANTRY_APPROVERS") {
            Ok(raw) => parse_approvers(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            bind_addr: std::env::var("GANTRY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            retry: RetryPolicy {
                max_retries: env_parse("GANTRY_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
                initial_delay: env_parse("GANTRY_RETRY_INITIAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.initial_delay),
                max_delay: env_parse("GANTRY_RETRY_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            },
            stage_timeout: env_parse("GANTRY_STAGE_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stage_timeout),
            cancel_grace: env_parse("GANTRY_CANCEL_GRACE")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cancel_grace),
            retention: env_parse("GANTRY_RETENTION_HOURS")
                .map(|hours: u64| Duration::from_secs(hours * 3600))
                .unwrap_or(defaults.retention),
            sweep_interval: env_parse("GANTRY_SWEEP_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            workspace: std::env::var("GANTRY_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace),
            approvers,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.retry.initial_delay.is_zero() {
            anyhow::bail!("retry initial delay must be greater than 0");
        }

        if self.retry.max_delay < self.retry.initial_delay {
            anyhow::bail!("retry max delay must not be smaller than the initial delay");
        }

        if self.stage_timeout.is_zero() {
            anyhow::bail!("stage_timeout must be greater than 0");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be greater than 0");
        }

        if self.workspace.as_os_str().is_empty() {
            anyhow::bail!("workspace cannot be empty");
        }

        Ok(())
    }

    pub fn approver_grants(&self) -> GrantSet {
        GrantSet::new(self.approvers.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(3600),
            cancel_grace: Duration::from_secs(30),
            retention: Duration::from_secs(168 * 3600),
            sweep_interval: Duration::from_secs(300),
            workspace: PathBuf::from("/tmp/gantry"),
            approvers: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse `actor=gate-pattern` pairs into approval grants.
///
/// A bare pattern without `gate/` prefix names a stage, so `alice=deploy-*`
/// lets alice decide every gate whose stage starts with `deploy-`.
pub fn parse_approvers(raw: &str) -> anyhow::Result<Vec<PermissionGrant>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (actor, pattern) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("approver '{}' must be 'actor=gate-pattern'", pair))?;
            let (actor, pattern) = (actor.trim(), pattern.trim());
            if actor.is_empty() || pattern.is_empty() {
                anyhow::bail!("approver '{}' must be 'actor=gate-pattern'", pair);
            }

            let resource = if pattern.starts_with("gate/") {
                pattern.to_string()
            } else {
                format!("gate/{}", pattern)
            };
            for candidate in [actor, resource.as_str()] {
                check_pattern(candidate).map_err(|e| {
                    anyhow::anyhow!("approver '{}' has a malformed pattern: {}", pair, e)
                })?;
            }
            Ok(PermissionGrant::new(actor, resource, [APPROVAL_ACTION]))
        })
        .collect()
}
