//! RemoveFailedPods: nominate pods in the Failed phase

use super::{Namespaces, PodScope};
use crate::api::ExtensionPoint;
use crate::error::{ConfigError, PluginError};
use crate::evictions::SkipReason;
use crate::framework::{
    decode_args, CycleContext, DeschedulePlugin, Handle, Nomination, Nominations, Plugin,
    PluginInstance,
};
use crate::models::{LabelSelector, Node, Pod, PodPhase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NAME: &str = "RemoveFailedPods";

pub(crate) const CAPABILITIES: &[ExtensionPoint] = &[ExtensionPoint::Deschedule];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoveFailedPodsArgs {
    /// Pod or container reasons to match; empty matches any reason
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub min_pod_lifetime_seconds: Option<u64>,
    #[serde(default)]
    pub including_init_containers: bool,
    #[serde(default)]
    pub exclude_owner_kinds: Vec<String>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
}

pub struct RemoveFailedPods {
    args: RemoveFailedPodsArgs,
    scope: PodScope,
}

pub fn new(args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: RemoveFailedPodsArgs = decode_args(NAME, args)?;
    let scope = PodScope::new(NAME, args.namespaces.clone(), args.label_selector.clone())?;
    Ok(PluginInstance::new(NAME).with_deschedule(Arc::new(RemoveFailedPods { args, scope })))
}

impl RemoveFailedPods {
    fn matches(&self, pod: &Pod) -> bool {
        if pod.phase != PodPhase::Failed || !self.scope.contains(pod) {
            return false;
        }
        if self
            .args
            .exclude_owner_kinds
            .iter()
            .any(|kind| pod.has_owner_kind(kind))
        {
            return false;
        }
        self.args.reasons.is_empty()
            || pod
                .reasons(self.args.including_init_containers)
                .iter()
                .any(|r| self.args.reasons.iter().any(|want| want == r))
    }
}

impl Plugin for RemoveFailedPods {
    fn name(&self) -> &str {
        NAME
    }
}

impl DeschedulePlugin for RemoveFailedPods {
    fn deschedule(&self, node: &Node, cycle: &CycleContext<'_>) -> Result<Nominations, PluginError> {
        let now = cycle.now();
        let min_lifetime = self
            .args
            .min_pod_lifetime_seconds
            .filter(|secs| *secs > 0)
            .map(super::seconds);

        let nominations = cycle
            .snapshot()
            .pods_on(&node.name)
            .iter()
            .filter(|pod| self.matches(pod))
            .map(|pod| match min_lifetime {
                Some(min) if pod.age(now).map(|age| age < min).unwrap_or(true) => {
                    Nomination::Hold(pod.clone(), SkipReason::MinLifetimeUnmet)
                }
                _ => Nomination::Evict(pod.clone()),
            })
            .collect();
        Ok(nominations)
    }
}
