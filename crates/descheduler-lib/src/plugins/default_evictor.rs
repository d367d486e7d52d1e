//! DefaultEvictor: the standard evictability predicates
//!
//! As a Filter it rejects pods that must never be evicted (mirror, static,
//! terminating, ownerless, DaemonSet, local storage, system critical, ...).
//! As a PreEvictionFilter with `nodeFit` it requires that some other node
//! could take the pod.

use super::{Namespaces, PodScope};
use crate::api::ExtensionPoint;
use crate::error::ConfigError;
use crate::framework::{
    decode_args, FilterPlugin, Handle, Plugin, PluginInstance, PreEvictionFilterPlugin, Verdict,
};
use crate::models::{LabelSelector, Pod, PodPhase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NAME: &str = "DefaultEvictor";

pub(crate) const CAPABILITIES: &[ExtensionPoint] =
    &[ExtensionPoint::Filter, ExtensionPoint::PreEvictionFilter];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DefaultEvictorArgs {
    #[serde(default)]
    pub evict_system_critical_pods: bool,
    #[serde(default)]
    pub evict_failed_bare_pods: bool,
    #[serde(default)]
    pub evict_local_storage_pods: bool,
    #[serde(default)]
    pub evict_daemon_set_pods: bool,
    #[serde(default)]
    pub ignore_pvc_pods: bool,
    #[serde(default)]
    pub priority_threshold: Option<PriorityThreshold>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, rename = "ignorePodsWithoutPDB")]
    pub ignore_pods_without_pdb: bool,
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub node_fit: bool,
}

/// Pods with priority at or above `value` are never evicted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorityThreshold {
    pub value: i32,
}

pub struct DefaultEvictor {
    args: DefaultEvictorArgs,
    scope: PodScope,
    handle: Handle,
}

pub fn new(args: &serde_json::Value, handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: DefaultEvictorArgs = decode_args(NAME, args)?;
    let plugin = Arc::new(DefaultEvictor::new(args, handle.clone())?);
    Ok(PluginInstance::new(NAME)
        .with_filter(plugin.clone())
        .with_pre_eviction_filter(plugin))
}

impl DefaultEvictor {
    pub fn new(args: DefaultEvictorArgs, handle: Handle) -> Result<Self, ConfigError> {
        let scope = PodScope::new(NAME, args.namespaces.clone(), args.label_selector.clone())?;
        Ok(Self {
            args,
            scope,
            handle,
        })
    }

    fn reject(&self, reason: &str) -> Verdict {
        Verdict::reject(NAME, reason)
    }

    /// Whether some other ready, schedulable node has room for the pod
    fn fits_elsewhere(&self, pod: &Pod) -> bool {
        let snapshot = self.handle.snapshot();
        let requests = pod.requests();

        snapshot.nodes().iter().any(|node| {
            if Some(&node.name) == pod.node_name.as_ref() || !node.is_schedulable() {
                return false;
            }
            let selector_ok = pod
                .node_selector
                .iter()
                .all(|(k, v)| node.labels.get(k) == Some(v));
            let free = node.allocatable.saturating_sub(&snapshot.requested_on(&node.name));
            selector_ok && requests.fits_in(&free)
        })
    }
}

impl Plugin for DefaultEvictor {
    fn name(&self) -> &str {
        NAME
    }
}

impl FilterPlugin for DefaultEvictor {
    fn filter(&self, pod: &Pod) -> Verdict {
        if pod.is_mirror() {
            return self.reject("pod is a mirror pod");
        }
        if pod.is_static() {
            return self.reject("pod is a static pod");
        }
        if pod.is_terminating() {
            return self.reject("pod is terminating");
        }
        if pod.owner_references.is_empty()
            && !(self.args.evict_failed_bare_pods && pod.phase == PodPhase::Failed)
        {
            return self.reject("pod has no owner");
        }
        if pod.is_daemonset_pod() && !self.args.evict_daemon_set_pods {
            return self.reject("pod is owned by a DaemonSet");
        }
        if !self.args.evict_system_critical_pods {
            if pod.is_system_critical() {
                return self.reject("pod is system critical");
            }
            if let Some(threshold) = &self.args.priority_threshold {
                if pod.priority.map(|p| p >= threshold.value).unwrap_or(false) {
                    return self.reject("pod priority is at or above the threshold");
                }
            }
        }
        if pod.has_local_storage() && !self.args.evict_local_storage_pods {
            return self.reject("pod uses local storage");
        }
        if pod.has_pvc() && self.args.ignore_pvc_pods {
            return self.reject("pod uses a PersistentVolumeClaim");
        }
        if !self.scope.contains(pod) {
            return self.reject("pod is outside the configured namespaces or label selector");
        }
        if self.args.ignore_pods_without_pdb && !self.handle.snapshot().is_guarded(pod) {
            return self.reject("pod is not covered by a PodDisruptionBudget");
        }
        Verdict::Admit
    }
}

impl PreEvictionFilterPlugin for DefaultEvictor {
    fn pre_evict(&self, pod: &Pod) -> Verdict {
        if self.args.node_fit && !self.fits_elsewhere(pod) {
            return self.reject("no other node can fit the pod");
        }
        Verdict::Admit
    }
}
