//! PodLifeTime: nominate pods older than a maximum age, oldest first

use super::{Namespaces, PodScope};
use crate::api::ExtensionPoint;
use crate::error::{ConfigError, PluginError};
use crate::framework::{
    decode_args, CycleContext, DeschedulePlugin, Handle, Nomination, Nominations, Plugin,
    PluginInstance,
};
use crate::models::{LabelSelector, Node, Pod};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NAME: &str = "PodLifeTime";

pub(crate) const CAPABILITIES: &[ExtensionPoint] = &[ExtensionPoint::Deschedule];

/// Pod phases and container waiting reasons accepted in `states`
const KNOWN_STATES: &[&str] = &[
    "Running",
    "Pending",
    "Succeeded",
    "Failed",
    "Unknown",
    "PodInitializing",
    "ContainerCreating",
    "CrashLoopBackOff",
    "CreateContainerConfigError",
    "CreateContainerError",
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodLifeTimeArgs {
    #[serde(default)]
    pub max_pod_life_time_seconds: Option<u64>,
    /// Pod phases or container waiting reasons; empty matches any state
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
}

pub struct PodLifeTime {
    max_age: Duration,
    states: Vec<String>,
    scope: PodScope,
}

pub fn new(args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: PodLifeTimeArgs = decode_args(NAME, args)?;
    let max_age = args
        .max_pod_life_time_seconds
        .map(super::seconds)
        .ok_or_else(|| ConfigError::invalid_args(NAME, "maxPodLifeTimeSeconds must be set"))?;
    if let Some(unknown) = args
        .states
        .iter()
        .find(|s| !KNOWN_STATES.contains(&s.as_str()))
    {
        return Err(ConfigError::invalid_args(
            NAME,
            format!("unsupported state {unknown:?}"),
        ));
    }
    let scope = PodScope::new(NAME, args.namespaces.clone(), args.label_selector.clone())?;

    Ok(PluginInstance::new(NAME).with_deschedule(Arc::new(PodLifeTime {
        max_age,
        states: args.states,
        scope,
    })))
}

impl PodLifeTime {
    fn in_state(&self, pod: &Pod) -> bool {
        if self.states.is_empty() {
            return true;
        }
        let phase = pod.phase.as_str();
        self.states.iter().any(|state| {
            state == phase
                || pod
                    .container_statuses
                    .iter()
                    .any(|s| s.waiting_reason.as_deref() == Some(state.as_str()))
        })
    }
}

impl Plugin for PodLifeTime {
    fn name(&self) -> &str {
        NAME
    }
}

impl DeschedulePlugin for PodLifeTime {
    fn deschedule(&self, node: &Node, cycle: &CycleContext<'_>) -> Result<Nominations, PluginError> {
        let now = cycle.now();
        let mut expired: Vec<&Pod> = cycle
            .snapshot()
            .pods_on(&node.name)
            .iter()
            .filter(|pod| self.scope.contains(pod) && self.in_state(pod))
            .filter(|pod| pod.age(now).map(|age| age > self.max_age).unwrap_or(false))
            .collect();

        expired.sort_by_key(|pod| pod.creation_timestamp.or(pod.start_time));
        Ok(expired
            .into_iter()
            .map(|pod| Nomination::Evict(pod.clone()))
            .collect())
    }
}
