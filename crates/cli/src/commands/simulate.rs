//! Dry-run descheduling cycle against a cluster dump or the live cluster

use anyhow::{Context, Result};
use descheduler_lib::{
    cluster::{node_from_k8s, pdb_from_k8s, pod_from_k8s, KubeSnapshotSource},
    Cancellation, Descheduler, DeschedulerOptions, Policy, RecordingEvictor, RunSummary,
    SnapshotSource, StaticSnapshotSource,
};
use k8s_openapi::api::{core::v1 as core, policy::v1::PodDisruptionBudget};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;

use crate::config::kubeconfig_path;
use crate::output::{
    color_count, format_duration_ms, print_info, print_json, print_table, print_warning,
    OutputFormat,
};

/// Where the simulated cycle reads cluster state from
pub enum ClusterInput<'a> {
    /// `kubectl get nodes,pods,pdb -A -o yaml` output, or any list of those kinds
    File(&'a Path),
    Live { kubeconfig: Option<&'a str> },
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Evicted")]
    evicted: String,
    #[tabled(rename = "Skipped")]
    skipped: String,
    #[tabled(rename = "Failed")]
    failed: String,
}

#[derive(Tabled)]
struct ReasonRow {
    #[tabled(rename = "Skip reason")]
    reason: String,
    #[tabled(rename = "Count")]
    count: usize,
}

/// Parse a list of Node, Pod and PodDisruptionBudget objects; other kinds
/// are ignored
pub fn parse_cluster_dump(raw: &str) -> Result<StaticSnapshotSource> {
    let list: ObjectList = serde_yaml::from_str(raw).context("Cluster file is not a list")?;

    let mut nodes = Vec::new();
    let mut pods = Vec::new();
    let mut budgets = Vec::new();
    for item in list.items {
        let kind = item
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "Node" => {
                let node: core::Node = serde_json::from_value(item).context("Invalid Node")?;
                nodes.push(node_from_k8s(&node));
            }
            "Pod" => {
                let pod: core::Pod = serde_json::from_value(item).context("Invalid Pod")?;
                pods.push(pod_from_k8s(&pod));
            }
            "PodDisruptionBudget" => {
                let pdb: PodDisruptionBudget =
                    serde_json::from_value(item).context("Invalid PodDisruptionBudget")?;
                budgets.extend(pdb_from_k8s(&pdb));
            }
            _ => {}
        }
    }

    Ok(StaticSnapshotSource::new(nodes, pods).with_disruption_budgets(budgets))
}

async fn kube_client(kubeconfig: Option<&str>) -> Result<kube::Client> {
    let path = kubeconfig_path(kubeconfig)?;
    let kubeconfig = Kubeconfig::read_from(&path)
        .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("Invalid kubeconfig")?;
    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Run one dry-run cycle and return its summary; nothing is evicted
pub async fn run_simulation(
    policy: Policy,
    source: Arc<dyn SnapshotSource>,
    max_parallel_nodes: usize,
    timeout: Option<Duration>,
) -> Result<RunSummary> {
    let options = DeschedulerOptions {
        dry_run: true,
        max_parallel_nodes: max_parallel_nodes.max(1),
        cycle_timeout: timeout,
        ..Default::default()
    };
    let descheduler = Descheduler::new(policy, source, Arc::new(RecordingEvictor::new()), options)
        .context("Invalid policy")?;

    descheduler
        .run_once(&Cancellation::none())
        .await
        .context("Failed to read cluster state")
}

pub async fn simulate(
    policy_path: &Path,
    input: ClusterInput<'_>,
    max_parallel_nodes: usize,
    timeout: Option<Duration>,
    format: OutputFormat,
) -> Result<()> {
    let policy = Policy::load(policy_path)
        .with_context(|| format!("Invalid policy {}", policy_path.display()))?;

    let source: Arc<dyn SnapshotSource> = match input {
        ClusterInput::File(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Arc::new(parse_cluster_dump(&raw)?)
        }
        ClusterInput::Live { kubeconfig } => {
            Arc::new(KubeSnapshotSource::new(kube_client(kubeconfig).await?))
        }
    };

    let summary = run_simulation(policy, source, max_parallel_nodes, timeout).await?;

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Table => print_summary(&summary),
    }
    Ok(())
}

/// Table view of a run summary
pub fn print_summary(summary: &RunSummary) {
    let nodes = summary
        .by_node
        .iter()
        .map(|(node, counts)| NodeRow {
            node: node.clone(),
            evicted: color_count(counts.evicted, "evicted"),
            skipped: color_count(counts.skipped, "skipped"),
            failed: color_count(counts.failed, "failed"),
        })
        .collect();
    print_table(nodes, "No eviction candidates");

    let reasons: Vec<ReasonRow> = summary
        .by_reason
        .iter()
        .map(|(reason, count)| ReasonRow {
            reason: reason.to_string(),
            count: *count,
        })
        .chain(summary.by_failure.iter().map(|(reason, count)| ReasonRow {
            reason: reason.to_string(),
            count: *count,
        }))
        .collect();
    if !reasons.is_empty() {
        print_table(reasons, "");
    }

    for failure in &summary.profile_errors {
        print_warning(&format!("profile {}: {}", failure.profile, failure.error));
    }
    if summary.deadline_exceeded {
        print_warning("Cycle deadline exceeded; remaining candidates were skipped");
    }

    let mode = if summary.dry_run { " (dry run)" } else { "" };
    print_info(&format!(
        "{} evicted, {} skipped, {} failed across {} nodes in {}{}",
        summary.evicted,
        summary.skipped,
        summary.failed,
        summary.nodes_considered,
        format_duration_ms(summary.duration_ms),
        mode,
    ));
}
