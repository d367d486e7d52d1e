//! Read-only cluster state
//!
//! A [`ClusterSnapshot`] is taken once per cycle and shared by every profile
//! in that cycle. Sources implement [`SnapshotSource`]; the Kubernetes
//! adapter lives in [`kubernetes`].

pub mod kubernetes;

use crate::models::{DisruptionBudget, LabelSelector, Node, Pod, PodPhase, ResourceList};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

pub use kubernetes::{node_from_k8s, pdb_from_k8s, pod_from_k8s, KubeEvictor, KubeSnapshotSource};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to list {resource}: {message}")]
    List {
        resource: &'static str,
        message: String,
    },
}

/// Trait for cluster state providers
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Take a consistent snapshot of the nodes matching `node_selector` and
    /// the pods assigned to them
    async fn snapshot(
        &self,
        node_selector: Option<&LabelSelector>,
    ) -> Result<ClusterSnapshot, SnapshotError>;
}

/// Nodes, pods indexed by node, and disruption budgets for one cycle
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    nodes: Vec<Node>,
    pods_by_node: HashMap<String, Vec<Pod>>,
    disruption_budgets: Vec<DisruptionBudget>,
    observed_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    /// Build a snapshot; pods without a node or on unselected nodes are dropped
    pub fn new(
        nodes: Vec<Node>,
        pods: Vec<Pod>,
        disruption_budgets: Vec<DisruptionBudget>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let mut pods_by_node: HashMap<String, Vec<Pod>> = nodes
            .iter()
            .map(|n| (n.name.clone(), Vec::new()))
            .collect();

        for pod in pods {
            let Some(node) = pod.node_name.clone() else {
                continue;
            };
            if let Some(list) = pods_by_node.get_mut(&node) {
                list.push(pod);
            }
        }

        for list in pods_by_node.values_mut() {
            list.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        }

        Self {
            nodes,
            pods_by_node,
            disruption_budgets,
            observed_at,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), Utc::now())
    }

    /// Keep only nodes matching the selector
    pub fn select_nodes(self, selector: Option<&LabelSelector>) -> Self {
        let Some(selector) = selector else {
            return self;
        };
        let ClusterSnapshot {
            nodes,
            mut pods_by_node,
            disruption_budgets,
            observed_at,
        } = self;

        let nodes: Vec<Node> = nodes
            .into_iter()
            .filter(|n| selector.matches(&n.labels))
            .collect();
        pods_by_node.retain(|name, _| nodes.iter().any(|n| &n.name == name));

        Self {
            nodes,
            pods_by_node,
            disruption_budgets,
            observed_at,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Pods on `node`, ordered by namespace and name
    pub fn pods_on(&self, node: &str) -> &[Pod] {
        self.pods_by_node
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All pods, grouped by node in node order
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.nodes
            .iter()
            .flat_map(move |n| self.pods_on(&n.name).iter())
    }

    pub fn disruption_budgets(&self) -> &[DisruptionBudget] {
        &self.disruption_budgets
    }

    /// Whether some disruption budget covers the pod
    pub fn is_guarded(&self, pod: &Pod) -> bool {
        self.disruption_budgets.iter().any(|b| b.covers(pod))
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Sum of requests of the non-terminal pods on `node`
    pub fn requested_on(&self, node: &str) -> ResourceList {
        let mut total = ResourceList::default();
        for pod in self.pods_on(node) {
            if matches!(pod.phase, PodPhase::Succeeded | PodPhase::Failed) {
                continue;
            }
            total += pod.requests();
        }
        total
    }
}

/// In-memory snapshot source
#[derive(Debug, Clone, Default)]
pub struct StaticSnapshotSource {
    nodes: Vec<Node>,
    pods: Vec<Pod>,
    disruption_budgets: Vec<DisruptionBudget>,
    observed_at: Option<DateTime<Utc>>,
}

impl StaticSnapshotSource {
    pub fn new(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        Self {
            nodes,
            pods,
            ..Default::default()
        }
    }

    pub fn with_disruption_budgets(mut self, budgets: Vec<DisruptionBudget>) -> Self {
        self.disruption_budgets = budgets;
        self
    }

    /// Pin the observation time instead of using the wall clock
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn snapshot(
        &self,
        node_selector: Option<&LabelSelector>,
    ) -> Result<ClusterSnapshot, SnapshotError> {
        let snapshot = ClusterSnapshot::new(
            self.nodes.clone(),
            self.pods.clone(),
            self.disruption_budgets.clone(),
            self.observed_at.unwrap_or_else(Utc::now),
        );
        Ok(snapshot.select_nodes(node_selector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        Node::new(name, ResourceList::new(4000, 8 << 30, 110))
    }

    #[test]
    fn test_snapshot_indexes_pods_by_node() {
        let snapshot = ClusterSnapshot::new(
            vec![node("n1"), node("n2")],
            vec![
                Pod::new("default", "b").on_node("n1"),
                Pod::new("default", "a").on_node("n1"),
                Pod::new("default", "c").on_node("n2"),
                Pod::new("default", "pending"),
                Pod::new("default", "elsewhere").on_node("n3"),
            ],
            Vec::new(),
            Utc::now(),
        );

        let names: Vec<&str> = snapshot.pods_on("n1").iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(snapshot.pods_on("n2").len(), 1);
        assert!(snapshot.pods_on("n3").is_empty());
        assert_eq!(snapshot.pods().count(), 3);
    }

    #[test]
    fn test_requested_skips_terminal_pods() {
        let snapshot = ClusterSnapshot::new(
            vec![node("n1")],
            vec![
                Pod::new("default", "a")
                    .on_node("n1")
                    .with_container("c", "img", ResourceList::new(100, 100, 0)),
                Pod::new("default", "b")
                    .on_node("n1")
                    .with_phase(PodPhase::Failed)
                    .with_container("c", "img", ResourceList::new(900, 900, 0)),
            ],
            Vec::new(),
            Utc::now(),
        );

        assert_eq!(snapshot.requested_on("n1"), ResourceList::new(100, 100, 1));
    }

    #[tokio::test]
    async fn test_static_source_applies_node_selector() {
        let source = StaticSnapshotSource::new(
            vec![node("n1").with_label("pool", "a"), node("n2").with_label("pool", "b")],
            vec![
                Pod::new("default", "x").on_node("n1"),
                Pod::new("default", "y").on_node("n2"),
            ],
        );

        let selector = LabelSelector::parse("pool=a").unwrap();
        let snapshot = source.snapshot(Some(&selector)).await.unwrap();

        assert_eq!(snapshot.nodes().len(), 1);
        assert_eq!(snapshot.nodes()[0].name, "n1");
        assert_eq!(snapshot.pods().count(), 1);
    }
}
