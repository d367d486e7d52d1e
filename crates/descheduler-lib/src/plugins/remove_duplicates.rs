//! RemoveDuplicates: spread pods of the same owner across nodes
//!
//! Pods are grouped by namespace, controlling owner and container images.
//! For every group that has more than one pod on some node, each node may
//! keep at most `ceil(group size / schedulable nodes)` of them; the excess
//! is nominated.

use super::Namespaces;
use crate::api::ExtensionPoint;
use crate::error::{ConfigError, PluginError};
use crate::framework::{
    decode_args, BalancePlugin, BalanceRound, CycleContext, Handle, Nomination, Nominations,
    Plugin, PluginInstance,
};
use crate::models::{Node, Pod};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "RemoveDuplicates";

pub(crate) const CAPABILITIES: &[ExtensionPoint] = &[ExtensionPoint::Balance];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoveDuplicatesArgs {
    #[serde(default)]
    pub exclude_owner_kinds: Vec<String>,
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
}

pub struct RemoveDuplicates {
    args: RemoveDuplicatesArgs,
}

pub fn new(args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: RemoveDuplicatesArgs = decode_args(NAME, args)?;
    if let Some(namespaces) = &args.namespaces {
        namespaces.validate(NAME)?;
    }
    Ok(PluginInstance::new(NAME).with_balance(Arc::new(RemoveDuplicates { args })))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OwnerKey {
    namespace: String,
    kind: String,
    name: String,
    images: Vec<String>,
}

impl RemoveDuplicates {
    fn owner_key(&self, pod: &Pod) -> Option<OwnerKey> {
        let owner = pod.controller_ref()?;
        if self.args.exclude_owner_kinds.contains(&owner.kind) {
            return None;
        }
        if let Some(namespaces) = &self.args.namespaces {
            if !namespaces.allows(&pod.namespace) {
                return None;
            }
        }
        let mut images: Vec<String> = pod.containers.iter().map(|c| c.image.clone()).collect();
        images.sort();
        Some(OwnerKey {
            namespace: pod.namespace.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            images,
        })
    }
}

impl Plugin for RemoveDuplicates {
    fn name(&self) -> &str {
        NAME
    }
}

impl BalancePlugin for RemoveDuplicates {
    fn plan<'a>(&'a self, cycle: &CycleContext<'_>) -> Result<Box<dyn BalanceRound + 'a>, PluginError> {
        let snapshot = cycle.snapshot();

        let mut groups: BTreeMap<OwnerKey, BTreeMap<&str, Vec<&Pod>>> = BTreeMap::new();
        for node in snapshot.nodes() {
            for pod in snapshot.pods_on(&node.name) {
                if !cycle.is_evictable(pod) {
                    continue;
                }
                if let Some(key) = self.owner_key(pod) {
                    groups
                        .entry(key)
                        .or_default()
                        .entry(node.name.as_str())
                        .or_default()
                        .push(pod);
                }
            }
        }

        let target_nodes = snapshot
            .nodes()
            .iter()
            .filter(|n| n.is_schedulable())
            .count()
            .max(1);

        let mut excess: HashMap<String, Vec<Pod>> = HashMap::new();
        for (key, per_node) in groups {
            if !per_node.values().any(|pods| pods.len() > 1) {
                continue;
            }
            let total: usize = per_node.values().map(Vec::len).sum();
            let upper_avg = total.div_ceil(target_nodes);
            debug!(
                namespace = %key.namespace,
                owner = %key.name,
                total,
                upper_avg,
                "Duplicate pods found"
            );
            for (node, pods) in per_node {
                if pods.len() > upper_avg {
                    excess
                        .entry(node.to_string())
                        .or_default()
                        .extend(pods[upper_avg..].iter().map(|p| (*p).clone()));
                }
            }
        }

        Ok(Box::new(DuplicatesRound { excess }))
    }
}

struct DuplicatesRound {
    excess: HashMap<String, Vec<Pod>>,
}

impl BalanceRound for DuplicatesRound {
    fn balance(&mut self, node: &Node, _cycle: &CycleContext<'_>) -> Result<Nominations, PluginError> {
        Ok(self
            .excess
            .remove(&node.name)
            .unwrap_or_default()
            .into_iter()
            .map(Nomination::Evict)
            .collect())
    }

    fn satisfied(&self) -> bool {
        self.excess.is_empty()
    }
}
