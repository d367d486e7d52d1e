//! Descheduler operator CLI
//!
//! Validates policies, lists the built-in plugins, simulates a dry-run
//! cycle and shows the status of a running descheduler.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{policy, simulate, status};
use std::path::PathBuf;
use std::time::Duration;

/// Descheduler operator CLI
#[derive(Parser)]
#[command(name = "deschedctl")]
#[command(author, version, about = "CLI for the Kubernetes descheduler", long_about = None)]
pub struct Cli {
    /// Descheduler API URL (can also be set via DESCHEDCTL_API_URL env var)
    #[arg(long, env = "DESCHEDCTL_API_URL")]
    pub api_url: Option<String>,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a policy file and build each of its profiles
    Validate {
        /// Policy file (YAML or JSON)
        policy: Option<PathBuf>,
    },

    /// List the built-in plugins and their extension points
    Plugins,

    /// Run one dry-run cycle and report what would be evicted
    Simulate {
        /// Policy file (YAML or JSON)
        #[arg(long, short)]
        policy: Option<PathBuf>,

        /// List of Nodes, Pods and PodDisruptionBudgets to use instead of the live cluster
        #[arg(long)]
        cluster: Option<PathBuf>,

        /// Node batches evaluated concurrently
        #[arg(long, default_value_t = 1)]
        max_parallel_nodes: usize,

        /// Deadline for the cycle in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show health and the last cycle of a running descheduler
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let result = match cli.command {
        Commands::Validate { policy: file } => {
            let path = config.policy(file)?;
            policy::validate(&path, cli.format)
        }
        Commands::Plugins => policy::list_plugins(cli.format),
        Commands::Simulate {
            policy: file,
            cluster,
            max_parallel_nodes,
            timeout,
        } => {
            let path = config.policy(file)?;
            let input = match &cluster {
                Some(file) => simulate::ClusterInput::File(file),
                None => simulate::ClusterInput::Live {
                    kubeconfig: cli.kubeconfig.as_deref(),
                },
            };
            simulate::simulate(
                &path,
                input,
                max_parallel_nodes,
                timeout.map(Duration::from_secs),
                cli.format,
            )
            .await
        }
        Commands::Status => {
            let client = client::ApiClient::new(&config.api_url(cli.api_url))?;
            status::show_status(&client, cli.format).await
        }
    };

    if let Err(err) = &result {
        output::print_error(&format!("{:#}", err));
    }
    result
}
