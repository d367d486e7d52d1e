//! Kubernetes API adapters
//!
//! Converts `k8s-openapi` objects into the descheduler models, lists them
//! through `kube` to build snapshots, and evicts pods through the eviction
//! subresource so disruption budgets are honoured by the API server.

use super::{ClusterSnapshot, SnapshotError, SnapshotSource};
use crate::evictions::{EvictError, Evictor};
use crate::models::{
    parse_bytes, parse_cpu_millis, parse_quantity, Container, ContainerStatus, DisruptionBudget,
    LabelSelector, LabelSelectorRequirement, Node, OwnerReference, Pod, PodPhase, ResourceList,
    SelectorOperator, Taint, Volume,
};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, warn};

fn resources(list: Option<&BTreeMap<String, Quantity>>) -> ResourceList {
    let Some(list) = list else {
        return ResourceList::default();
    };
    let get = |key: &str| list.get(key).map(|q| q.0.as_str());
    ResourceList {
        cpu_millis: get("cpu").and_then(parse_cpu_millis).unwrap_or(0),
        memory_bytes: get("memory").and_then(parse_bytes).unwrap_or(0),
        pods: get("pods")
            .and_then(parse_quantity)
            .map(|p| p as i64)
            .unwrap_or(0),
    }
}

pub fn node_from_k8s(node: &core::Node) -> Node {
    let spec = node.spec.clone().unwrap_or_default();
    let status = node.status.clone().unwrap_or_default();

    let ready = status
        .conditions
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status == "True")
        .unwrap_or(false);

    Node {
        name: node.metadata.name.clone().unwrap_or_default(),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        allocatable: resources(status.allocatable.as_ref()),
        unschedulable: spec.unschedulable.unwrap_or(false),
        ready,
        taints: spec
            .taints
            .unwrap_or_default()
            .into_iter()
            .map(|t| Taint {
                key: t.key,
                value: t.value,
                effect: t.effect,
            })
            .collect(),
    }
}

fn container(c: &core::Container) -> Container {
    Container {
        name: c.name.clone(),
        image: c.image.clone().unwrap_or_default(),
        requests: resources(c.resources.as_ref().and_then(|r| r.requests.as_ref())),
    }
}

fn container_status(s: &core::ContainerStatus) -> ContainerStatus {
    let state = s.state.as_ref();
    ContainerStatus {
        name: s.name.clone(),
        restart_count: s.restart_count,
        waiting_reason: state
            .and_then(|st| st.waiting.as_ref())
            .and_then(|w| w.reason.clone()),
        terminated_reason: state
            .and_then(|st| st.terminated.as_ref())
            .and_then(|t| t.reason.clone()),
    }
}

fn volume(v: &core::Volume) -> Volume {
    if let Some(claim) = &v.persistent_volume_claim {
        Volume::PersistentVolumeClaim {
            name: v.name.clone(),
            claim_name: claim.claim_name.clone(),
        }
    } else if let Some(empty_dir) = &v.empty_dir {
        Volume::EmptyDir {
            name: v.name.clone(),
            medium: empty_dir.medium.clone(),
        }
    } else if v.host_path.is_some() {
        Volume::HostPath {
            name: v.name.clone(),
        }
    } else {
        Volume::Other {
            name: v.name.clone(),
        }
    }
}

pub fn pod_from_k8s(pod: &core::Pod) -> Pod {
    let meta = &pod.metadata;
    let spec = pod.spec.clone().unwrap_or_default();
    let status = pod.status.clone().unwrap_or_default();

    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".to_string());
    let name = meta.name.clone().unwrap_or_default();

    Pod {
        uid: meta
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}-{}", namespace, name)),
        node_name: spec.node_name.clone(),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        owner_references: meta
            .owner_references
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|o| OwnerReference {
                kind: o.kind,
                name: o.name,
                uid: o.uid,
                controller: o.controller.unwrap_or(false),
            })
            .collect(),
        phase: status
            .phase
            .as_deref()
            .map(PodPhase::parse)
            .unwrap_or(PodPhase::Unknown),
        reason: status.reason.clone(),
        priority: spec.priority,
        priority_class_name: spec.priority_class_name.clone(),
        creation_timestamp: meta.creation_timestamp.as_ref().map(|t| t.0),
        start_time: status.start_time.as_ref().map(|t| t.0),
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
        containers: spec.containers.iter().map(container).collect(),
        init_containers: spec
            .init_containers
            .unwrap_or_default()
            .iter()
            .map(container)
            .collect(),
        container_statuses: status
            .container_statuses
            .unwrap_or_default()
            .iter()
            .map(container_status)
            .collect(),
        init_container_statuses: status
            .init_container_statuses
            .unwrap_or_default()
            .iter()
            .map(container_status)
            .collect(),
        volumes: spec.volumes.unwrap_or_default().iter().map(volume).collect(),
        node_selector: spec.node_selector.unwrap_or_default(),
        namespace,
        name,
    }
}

fn selector_from_k8s(selector: &meta::LabelSelector) -> Option<LabelSelector> {
    let mut expressions = Vec::new();
    for requirement in selector.match_expressions.iter().flatten() {
        let operator = match requirement.operator.as_str() {
            "In" => SelectorOperator::In,
            "NotIn" => SelectorOperator::NotIn,
            "Exists" => SelectorOperator::Exists,
            "DoesNotExist" => SelectorOperator::DoesNotExist,
            _ => return None,
        };
        expressions.push(LabelSelectorRequirement {
            key: requirement.key.clone(),
            operator,
            values: requirement.values.clone().unwrap_or_default(),
        });
    }
    Some(LabelSelector {
        match_labels: selector.match_labels.clone().unwrap_or_default(),
        match_expressions: expressions,
    })
}

/// Budgets without a selector (or with an unknown operator) guard nothing
/// and are dropped
pub fn pdb_from_k8s(pdb: &PodDisruptionBudget) -> Option<DisruptionBudget> {
    let selector = pdb.spec.as_ref()?.selector.as_ref()?;
    let selector = selector_from_k8s(selector)?;
    Some(DisruptionBudget {
        namespace: pdb.metadata.namespace.clone().unwrap_or_default(),
        name: pdb.metadata.name.clone().unwrap_or_default(),
        selector,
    })
}

fn list_error(resource: &'static str) -> impl FnOnce(kube::Error) -> SnapshotError {
    move |err| SnapshotError::List {
        resource,
        message: err.to_string(),
    }
}

/// Snapshot source backed by the API server
#[derive(Clone)]
pub struct KubeSnapshotSource {
    client: Client,
}

impl KubeSnapshotSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotSource for KubeSnapshotSource {
    async fn snapshot(
        &self,
        node_selector: Option<&LabelSelector>,
    ) -> Result<ClusterSnapshot, SnapshotError> {
        let params = ListParams::default();

        let nodes = Api::<core::Node>::all(self.client.clone())
            .list(&params)
            .await
            .map_err(list_error("nodes"))?;
        let pods = Api::<core::Pod>::all(self.client.clone())
            .list(&params)
            .await
            .map_err(list_error("pods"))?;
        let budgets = Api::<PodDisruptionBudget>::all(self.client.clone())
            .list(&params)
            .await
            .map_err(list_error("poddisruptionbudgets"))?;

        debug!(
            nodes = nodes.items.len(),
            pods = pods.items.len(),
            disruption_budgets = budgets.items.len(),
            "Listed cluster state"
        );

        let snapshot = ClusterSnapshot::new(
            nodes.items.iter().map(node_from_k8s).collect(),
            pods.items.iter().map(pod_from_k8s).collect(),
            budgets.items.iter().filter_map(pdb_from_k8s).collect(),
            Utc::now(),
        );
        Ok(snapshot.select_nodes(node_selector))
    }
}

/// Map an API failure to the eviction error taxonomy
pub(crate) fn evict_error(err: kube::Error) -> EvictError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => EvictError::NotFound(response.message),
            409 => EvictError::Conflict(response.message),
            429 => EvictError::DisruptionBudget(response.message),
            _ => EvictError::Other(response.message),
        },
        other => EvictError::Other(other.to_string()),
    }
}

/// Evicts pods through the `pods/eviction` subresource
#[derive(Clone)]
pub struct KubeEvictor {
    client: Client,
}

impl KubeEvictor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Evictor for KubeEvictor {
    async fn evict(&self, pod: &Pod, dry_run: bool) -> Result<(), EvictError> {
        let api: Api<core::Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                dry_run,
                ..DeleteParams::default()
            }),
            post_options: PostParams {
                dry_run,
                ..PostParams::default()
            },
        };

        api.evict(&pod.name, &params).await.map_err(|err| {
            let err = evict_error(err);
            if matches!(err, EvictError::Other(_)) {
                warn!(pod = %pod.key(), error = %err, "Eviction request failed");
            }
            err
        })?;
        Ok(())
    }
}
