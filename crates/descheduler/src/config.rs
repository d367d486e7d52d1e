//! Daemon configuration

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command line flags; each one overrides the matching environment setting
#[derive(Debug, Default, Parser)]
#[command(name = "descheduler", version, about = "Evicts pods that violate placement policies")]
pub struct Flags {
    /// Path to the policy document (YAML or JSON)
    #[arg(long)]
    pub policy_config_file: Option<PathBuf>,

    /// Seconds between cycles; 0 runs a single cycle and exits
    #[arg(long)]
    pub descheduling_interval: Option<u64>,

    /// Report what would be evicted without evicting
    #[arg(long)]
    pub dry_run: bool,

    /// Port for the health, metrics and summary endpoints
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Node batches evicted concurrently
    #[arg(long)]
    pub max_parallel_nodes: Option<usize>,

    /// Deadline for one cycle in seconds
    #[arg(long)]
    pub cycle_timeout: Option<u64>,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeschedulerConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    #[serde(default = "default_policy_file")]
    pub policy_config_file: PathBuf,

    #[serde(default = "default_interval")]
    pub descheduling_interval_secs: u64,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,

    /// Unset means no deadline
    #[serde(default)]
    pub cycle_timeout_secs: Option<u64>,
}

fn default_instance() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "descheduler".to_string())
}

fn default_policy_file() -> PathBuf {
    PathBuf::from("/policy-dir/policy.yaml")
}

fn default_interval() -> u64 {
    300
}

fn default_api_port() -> u16 {
    10258
}

fn default_max_parallel_nodes() -> usize {
    1
}

impl Default for DeschedulerConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            policy_config_file: default_policy_file(),
            descheduling_interval_secs: default_interval(),
            dry_run: false,
            api_port: default_api_port(),
            max_parallel_nodes: default_max_parallel_nodes(),
            cycle_timeout_secs: None,
        }
    }
}

impl DeschedulerConfig {
    /// Load configuration from `DESCHEDULER_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("DESCHEDULER"))
            .build()
            .context("failed to read environment configuration")?;

        config
            .try_deserialize()
            .context("invalid DESCHEDULER_* configuration")
    }

    /// Apply command line overrides
    pub fn merge(mut self, flags: Flags) -> Self {
        if let Some(path) = flags.policy_config_file {
            self.policy_config_file = path;
        }
        if let Some(interval) = flags.descheduling_interval {
            self.descheduling_interval_secs = interval;
        }
        if flags.dry_run {
            self.dry_run = true;
        }
        if let Some(port) = flags.api_port {
            self.api_port = port;
        }
        if let Some(parallel) = flags.max_parallel_nodes {
            self.max_parallel_nodes = parallel;
        }
        if let Some(timeout) = flags.cycle_timeout {
            self.cycle_timeout_secs = Some(timeout);
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.descheduling_interval_secs)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
