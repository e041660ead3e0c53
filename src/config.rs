//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `BELAY_BRIDGE_ADDR`: control-channel bind address (default: 127.0.0.1:0, ephemeral)
//! - `BELAY_MAX_WORKERS`: upper bound on the worker pool (default: num_cpus)
//! - `BELAY_WORKER_COMMAND`: worker process entry command (default: belay-worker)
//! - `BELAY_LIVENESS_INTERVAL_MS`: minimum gap between liveness sweeps (default: 5000)
//! - `BELAY_IDLE_GRACE_MS`: dispatch-idle period before reclamation kicks in (default: 5000)
//! - `BELAY_SUPERVISOR_POLL_MS`: supervisory loop signal poll window (default: 100)
//! - `BELAY_SUSPEND_POLL_MS`: worker-side suspend-handle poll window (default: 200)
//! - `BELAY_IDLE_BACKOFF_MS`: worker backoff after an empty reply (default: 100)

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{manager::ManagerConfig, supervisor::SupervisorConfig};

/// Default bind address for the worker bridge. Port 0 lets the OS pick an
/// ephemeral port; the bound address is available from the bridge afterwards.
pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:0";

/// Default worker process entry command, expected on PATH. Consumers build it
/// by linking this crate and calling [`crate::worker::run_worker`].
pub const DEFAULT_WORKER_COMMAND: &str = "belay-worker";

/// Pool-level configuration, loaded once per run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the control-channel bridge
    pub bridge_addr: SocketAddr,

    /// Upper bound on concurrently live workers
    pub max_workers: usize,

    /// Command used to spawn worker processes
    pub worker_command: PathBuf,

    /// Minimum gap between worker liveness sweeps (milliseconds)
    pub liveness_interval_ms: u64,

    /// Dispatch-idle period before idle workers are reclaimed (milliseconds)
    pub idle_grace_ms: u64,

    /// Supervisory loop readiness poll window (milliseconds)
    pub supervisor_poll_ms: u64,

    /// Worker suspend-handle poll window (milliseconds)
    pub suspend_poll_ms: u64,

    /// Worker backoff after an empty reply (milliseconds)
    pub idle_backoff_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` if present, then reads from the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let bridge_addr =
            env::var("BELAY_BRIDGE_ADDR").unwrap_or_else(|_| DEFAULT_BRIDGE_ADDR.to_string());
        let bridge_addr =
            SocketAddr::from_str(&bridge_addr).context("invalid BELAY_BRIDGE_ADDR format")?;

        let max_workers = env::var("BELAY_MAX_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| num_cpus::get().max(1));

        let worker_command = env::var("BELAY_WORKER_COMMAND")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKER_COMMAND));

        let liveness_interval_ms = env::var("BELAY_LIVENESS_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let idle_grace_ms = env::var("BELAY_IDLE_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let supervisor_poll_ms = env::var("BELAY_SUPERVISOR_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let suspend_poll_ms = env::var("BELAY_SUSPEND_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(200);

        let idle_backoff_ms = env::var("BELAY_IDLE_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        Ok(Self {
            bridge_addr,
            max_workers,
            worker_command,
            liveness_interval_ms,
            idle_grace_ms,
            supervisor_poll_ms,
            suspend_poll_ms,
            idle_backoff_ms,
        })
    }

    /// Manager timing knobs derived from this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_workers: self.max_workers,
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            idle_grace: Duration::from_millis(self.idle_grace_ms),
            ..ManagerConfig::default()
        }
    }

    /// Supervisor timing knobs derived from this configuration.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(self.supervisor_poll_ms),
            ..SupervisorConfig::default()
        }
    }

    /// Create a test configuration with defaults and an ephemeral bridge port.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            bridge_addr: "127.0.0.1:0".parse().unwrap(),
            max_workers: 2,
            worker_command: PathBuf::from(DEFAULT_WORKER_COMMAND),
            liveness_interval_ms: 5000,
            idle_grace_ms: 5000,
            supervisor_poll_ms: 50,
            suspend_poll_ms: 50,
            idle_backoff_ms: 20,
        }
    }
}

/// Per-request run configuration, equivalent to the engine's command-line
/// options. Travels inside step and workflow requests and is handed to the
/// worker process at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Path to the user configuration file (`-c`)
    pub config_file: Option<PathBuf>,
    /// Path for DAG output (`-d`)
    pub output_dag: Option<PathBuf>,
    /// Execution mode
    pub run_mode: RunMode,
    /// Logging verbosity, 0 (errors only) through 3+ (debug)
    pub verbosity: u8,
    /// Signature handling mode for build avoidance
    pub sig_mode: SigMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            config_file: None,
            output_dag: None,
            run_mode: RunMode::Run,
            verbosity: 2,
            sig_mode: SigMode::Default,
        }
    }
}

/// Execution mode for steps and workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Run,
    Dryrun,
    Interactive,
}

/// Signature handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigMode {
    /// Honor existing signatures, write new ones
    Default,
    /// Ignore signatures entirely
    Ignore,
    /// Re-execute and overwrite signatures
    Force,
    /// Write signatures without checking
    Build,
    /// Fail when signatures do not match
    Assert,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::test_config();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.bridge_addr.port(), 0);

        let manager = config.manager_config();
        assert_eq!(manager.max_workers, 2);
        assert_eq!(manager.liveness_interval, Duration::from_secs(5));
        assert_eq!(manager.idle_grace, Duration::from_secs(5));
    }

    #[test]
    fn run_config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.run_mode, RunMode::Run);
        assert_eq!(config.sig_mode, SigMode::Default);
        assert_eq!(config.verbosity, 2);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn run_mode_serializes_lowercase() {
        let json = serde_json::to_string(&RunMode::Dryrun).unwrap();
        assert_eq!(json, "\"dryrun\"");
        let back: RunMode = serde_json::from_str("\"interactive\"").unwrap();
        assert_eq!(back, RunMode::Interactive);
    }
}
