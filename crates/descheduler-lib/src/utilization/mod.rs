//! Node utilization
//!
//! The [`UtilizationIndex`] is computed once per cycle. When a
//! [`UtilizationSource`] reports actual usage for a node, its cpu and memory
//! figures are used; otherwise usage is estimated from the requests of the
//! pods bound to the node. The pod count always comes from the snapshot.

mod metrics_server;

pub use metrics_server::MetricsServerSource;

use crate::cluster::ClusterSnapshot;
use crate::framework::Cancellation;
use crate::models::{ResourceList, ResourceName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const MAX_CONCURRENT_QUERIES: usize = 16;

/// Observed resource usage of a node
pub type ResourceUsage = ResourceList;

/// Trait for actual-usage providers
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current usage of `node`, or `None` when unavailable
    async fn node_usage(&self, node: &str) -> Option<ResourceUsage>;
}

/// Fixed usage figures
#[derive(Debug, Clone, Default)]
pub struct StaticUtilization {
    usage: HashMap<String, ResourceUsage>,
}

impl StaticUtilization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: impl Into<String>, usage: ResourceUsage) -> Self {
        self.usage.insert(node.into(), usage);
        self
    }
}

#[async_trait]
impl UtilizationSource for StaticUtilization {
    fn name(&self) -> &str {
        "static"
    }

    async fn node_usage(&self, node: &str) -> Option<ResourceUsage> {
        self.usage.get(node).copied()
    }
}

/// Where a node's usage figures came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageOrigin {
    Metrics,
    Requests,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUtilization {
    pub allocatable: ResourceList,
    pub usage: ResourceList,
    pub origin: UsageOrigin,
}

impl NodeUtilization {
    /// Usage of `resource` as a percentage of allocatable
    pub fn percent(&self, resource: ResourceName) -> f64 {
        let allocatable = self.allocatable.get(resource);
        if allocatable <= 0 {
            return 0.0;
        }
        self.usage.get(resource) as f64 * 100.0 / allocatable as f64
    }
}

/// Per-node utilization for one cycle
#[derive(Debug, Clone, Default)]
pub struct UtilizationIndex {
    nodes: HashMap<String, NodeUtilization>,
}

impl UtilizationIndex {
    /// Estimate every node from pod requests
    pub fn from_requests(snapshot: &ClusterSnapshot) -> Self {
        let nodes = snapshot
            .nodes()
            .iter()
            .map(|node| {
                (
                    node.name.clone(),
                    NodeUtilization {
                        allocatable: node.allocatable,
                        usage: snapshot.requested_on(&node.name),
                        origin: UsageOrigin::Requests,
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    /// Prefer the source's figures, falling back to requests per node.
    /// Nodes are queried concurrently; once `cancel` fires the nodes still
    /// pending keep their request estimates.
    pub async fn build(
        snapshot: &ClusterSnapshot,
        source: Option<&Arc<dyn UtilizationSource>>,
        cancel: &Cancellation,
    ) -> Self {
        let mut index = Self::from_requests(snapshot);
        let Some(source) = source else {
            return index;
        };

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES));
        let mut tasks = JoinSet::new();
        for name in index.nodes.keys() {
            let source = source.clone();
            let semaphore = semaphore.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let usage = source.node_usage(&name).await;
                (name, usage)
            });
        }

        let source_name = source.name();
        let collected = cancel
            .run_until(async {
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((name, Some(actual))) => index.apply(&name, actual),
                        Ok((name, None)) => {
                            debug!(node = %name, source = source_name, "No usage reported, using requests");
                        }
                        Err(err) => warn!(source = source_name, error = %err, "Usage query failed"),
                    }
                }
            })
            .await;
        if collected.is_none() {
            warn!(
                source = source_name,
                pending = tasks.len(),
                "Cycle cancelled while querying usage, using requests for pending nodes"
            );
        }
        index
    }

    fn apply(&mut self, node: &str, actual: ResourceUsage) {
        if let Some(entry) = self.nodes.get_mut(node) {
            entry.usage.cpu_millis = actual.cpu_millis;
            entry.usage.memory_bytes = actual.memory_bytes;
            entry.origin = UsageOrigin::Metrics;
        }
    }

    /// Number of nodes whose figures came from `origin`
    pub fn count(&self, origin: UsageOrigin) -> usize {
        self.nodes.values().filter(|n| n.origin == origin).count()
    }

    pub fn get(&self, node: &str) -> Option<&NodeUtilization> {
        self.nodes.get(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
