//! Core data models for the descheduler
//!
//! These are the read-only views of cluster objects the framework and
//! plugins reason about. They are deliberately decoupled from the
//! Kubernetes API types; the `cluster::kubernetes` adapter converts into them.

mod quantity;
mod selector;

pub use quantity::{parse_bytes, parse_cpu_millis, parse_quantity, ResourceList, ResourceName};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorError, SelectorOperator};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation set by the kubelet on mirror pods
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Annotation recording where the kubelet read a pod definition from
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";

/// Priority at and above which a pod is considered system critical
pub const SYSTEM_CRITICAL_PRIORITY: i32 = 2_000_000_000;

/// Built-in priority classes reserved for critical system pods
pub const SYSTEM_PRIORITY_CLASSES: &[&str] = &["system-cluster-critical", "system-node-critical"];

/// A node taint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    pub effect: String,
}

/// A cluster node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub allocatable: ResourceList,
    pub unschedulable: bool,
    pub ready: bool,
    pub taints: Vec<Taint>,
}

impl Node {
    pub fn new(name: impl Into<String>, allocatable: ResourceList) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            allocatable,
            unschedulable: false,
            ready: true,
            taints: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn cordoned(mut self) -> Self {
        self.unschedulable = true;
        self
    }

    /// Whether new pods could be placed here
    pub fn is_schedulable(&self) -> bool {
        self.ready
            && !self.unschedulable
            && !self
                .taints
                .iter()
                .any(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
    }
}

/// Reference from a pod to the object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub requests: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub restart_count: i32,
    pub waiting_reason: Option<String>,
    pub terminated_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Volume {
    EmptyDir { name: String, medium: Option<String> },
    HostPath { name: String },
    PersistentVolumeClaim { name: String, claim_name: String },
    Other { name: String },
}

/// A workload instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    pub phase: PodPhase,
    pub reason: Option<String>,
    pub priority: Option<i32>,
    pub priority_class_name: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
    pub container_statuses: Vec<ContainerStatus>,
    pub init_container_statuses: Vec<ContainerStatus>,
    pub volumes: Vec<Volume>,
    pub node_selector: BTreeMap<String, String>,
}

impl Pod {
    /// Create a running pod with no owner, containers or volumes
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        Self {
            uid: format!("{}-{}", namespace, name),
            name,
            namespace,
            node_name: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner_references: Vec::new(),
            phase: PodPhase::Running,
            reason: None,
            priority: None,
            priority_class_name: None,
            creation_timestamp: None,
            start_time: None,
            deletion_timestamp: None,
            containers: Vec::new(),
            init_containers: Vec::new(),
            container_statuses: Vec::new(),
            init_container_statuses: Vec::new(),
            volumes: Vec::new(),
            node_selector: BTreeMap::new(),
        }
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }

    pub fn with_phase(mut self, phase: PodPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn owned_by(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        let kind = kind.into();
        let name = name.into();
        self.owner_references.push(OwnerReference {
            uid: format!("{}-{}", kind.to_lowercase(), name),
            kind,
            name,
            controller: true,
        });
        self
    }

    pub fn with_container(
        mut self,
        name: impl Into<String>,
        image: impl Into<String>,
        requests: ResourceList,
    ) -> Self {
        self.containers.push(Container {
            name: name.into(),
            image: image.into(),
            requests,
        });
        self
    }

    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.creation_timestamp = Some(at);
        self.start_time = Some(at);
        self
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn is_mirror(&self) -> bool {
        self.annotations.contains_key(MIRROR_POD_ANNOTATION)
    }

    /// Static pods are read by the kubelet from a source other than the API server
    pub fn is_static(&self) -> bool {
        self.annotations
            .get(CONFIG_SOURCE_ANNOTATION)
            .map(|source| source != "api")
            .unwrap_or(false)
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// The controlling owner, falling back to the first owner reference
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|o| o.controller)
            .or_else(|| self.owner_references.first())
    }

    pub fn has_owner_kind(&self, kind: &str) -> bool {
        self.owner_references.iter().any(|o| o.kind == kind)
    }

    pub fn is_daemonset_pod(&self) -> bool {
        self.has_owner_kind("DaemonSet")
    }

    /// Uses emptyDir (not memory backed) or hostPath volumes
    pub fn has_local_storage(&self) -> bool {
        self.volumes.iter().any(|v| match v {
            Volume::HostPath { .. } => true,
            Volume::EmptyDir { medium, .. } => medium.as_deref() != Some("Memory"),
            _ => false,
        })
    }

    pub fn has_pvc(&self) -> bool {
        self.volumes
            .iter()
            .any(|v| matches!(v, Volume::PersistentVolumeClaim { .. }))
    }

    pub fn is_system_critical(&self) -> bool {
        if let Some(class) = &self.priority_class_name {
            if SYSTEM_PRIORITY_CLASSES.contains(&class.as_str()) {
                return true;
            }
        }
        self.priority
            .map(|p| p >= SYSTEM_CRITICAL_PRIORITY)
            .unwrap_or(false)
    }

    /// Effective requests: the larger of the summed app containers and any
    /// single init container, plus one pod slot
    pub fn requests(&self) -> ResourceList {
        let mut total = ResourceList::default();
        for container in &self.containers {
            total += container.requests;
        }
        for init in &self.init_containers {
            total.cpu_millis = total.cpu_millis.max(init.requests.cpu_millis);
            total.memory_bytes = total.memory_bytes.max(init.requests.memory_bytes);
        }
        total.pods = 1;
        total
    }

    /// Time since the pod started (or was created), if known
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.start_time
            .or(self.creation_timestamp)
            .map(|started| now - started)
    }

    /// Sum of container restarts, optionally including init containers
    pub fn restarts(&self, including_init: bool) -> i32 {
        let app: i32 = self.container_statuses.iter().map(|s| s.restart_count).sum();
        if including_init {
            app + self
                .init_container_statuses
                .iter()
                .map(|s| s.restart_count)
                .sum::<i32>()
        } else {
            app
        }
    }

    /// Pod reason followed by waiting/terminated reasons of its containers
    pub fn reasons(&self, including_init: bool) -> Vec<&str> {
        let mut reasons: Vec<&str> = self.reason.iter().map(String::as_str).collect();
        let statuses = self.container_statuses.iter().chain(
            self.init_container_statuses
                .iter()
                .filter(move |_| including_init),
        );
        for status in statuses {
            reasons.extend(status.waiting_reason.as_deref());
            reasons.extend(status.terminated_reason.as_deref());
        }
        reasons
    }
}

/// A PodDisruptionBudget guarding a set of pods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionBudget {
    pub namespace: String,
    pub name: String,
    pub selector: LabelSelector,
}

impl DisruptionBudget {
    pub fn covers(&self, pod: &Pod) -> bool {
        self.namespace == pod.namespace && self.selector.matches(&pod.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_requests_include_init_containers() {
        let mut pod = Pod::new("default", "web")
            .with_container("a", "nginx", ResourceList::new(100, 1000, 0))
            .with_container("b", "envoy", ResourceList::new(50, 500, 0));
        pod.init_containers.push(Container {
            name: "init".to_string(),
            image: "busybox".to_string(),
            requests: ResourceList::new(500, 100, 0),
        });

        assert_eq!(pod.requests(), ResourceList::new(500, 1500, 1));
    }

    #[test]
    fn test_pod_classification() {
        let pod = Pod::new("kube-system", "etcd")
            .with_annotation(MIRROR_POD_ANNOTATION, "abc")
            .with_annotation(CONFIG_SOURCE_ANNOTATION, "file");
        assert!(pod.is_mirror());
        assert!(pod.is_static());

        let api_pod = Pod::new("default", "web").with_annotation(CONFIG_SOURCE_ANNOTATION, "api");
        assert!(!api_pod.is_static());

        let ds = Pod::new("default", "agent").owned_by("DaemonSet", "agent");
        assert!(ds.is_daemonset_pod());
        assert_eq!(ds.controller_ref().map(|o| o.kind.as_str()), Some("DaemonSet"));
    }

    #[test]
    fn test_local_storage_ignores_memory_backed_empty_dir() {
        let tmpfs = Pod::new("default", "a").with_volume(Volume::EmptyDir {
            name: "cache".to_string(),
            medium: Some("Memory".to_string()),
        });
        assert!(!tmpfs.has_local_storage());

        let disk = Pod::new("default", "b").with_volume(Volume::EmptyDir {
            name: "cache".to_string(),
            medium: None,
        });
        assert!(disk.has_local_storage());
    }

    #[test]
    fn test_system_critical() {
        assert!(Pod::new("kube-system", "a")
            .with_priority(SYSTEM_CRITICAL_PRIORITY)
            .is_system_critical());

        let mut by_class = Pod::new("kube-system", "b");
        by_class.priority_class_name = Some("system-node-critical".to_string());
        assert!(by_class.is_system_critical());

        assert!(!Pod::new("default", "c").with_priority(1000).is_system_critical());
    }

    #[test]
    fn test_restarts_and_reasons() {
        let mut pod = Pod::new("default", "crashy");
        pod.reason = Some("Evicted".to_string());
        pod.container_statuses.push(ContainerStatus {
            name: "app".to_string(),
            restart_count: 4,
            waiting_reason: Some("CrashLoopBackOff".to_string()),
            terminated_reason: None,
        });
        pod.init_container_statuses.push(ContainerStatus {
            name: "init".to_string(),
            restart_count: 2,
            waiting_reason: None,
            terminated_reason: Some("Error".to_string()),
        });

        assert_eq!(pod.restarts(false), 4);
        assert_eq!(pod.restarts(true), 6);
        assert_eq!(pod.reasons(false), vec!["Evicted", "CrashLoopBackOff"]);
        assert_eq!(pod.reasons(true), vec!["Evicted", "CrashLoopBackOff", "Error"]);
    }

    #[test]
    fn test_disruption_budget_covers() {
        let pdb = DisruptionBudget {
            namespace: "default".to_string(),
            name: "web".to_string(),
            selector: LabelSelector::parse("app=web").unwrap(),
        };

        assert!(pdb.covers(&Pod::new("default", "a").with_label("app", "web")));
        assert!(!pdb.covers(&Pod::new("other", "a").with_label("app", "web")));
        assert!(!pdb.covers(&Pod::new("default", "a").with_label("app", "db")));
    }
}
