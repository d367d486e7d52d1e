//! RemovePodsHavingTooManyRestarts: nominate crash-looping pods

use super::{Namespaces, PodScope};
use crate::api::ExtensionPoint;
use crate::error::{ConfigError, PluginError};
use crate::framework::{
    decode_args, CycleContext, DeschedulePlugin, Handle, Nomination, Nominations, Plugin,
    PluginInstance,
};
use crate::models::{LabelSelector, Node};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NAME: &str = "RemovePodsHavingTooManyRestarts";

pub(crate) const CAPABILITIES: &[ExtensionPoint] = &[ExtensionPoint::Deschedule];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TooManyRestartsArgs {
    #[serde(default)]
    pub pod_restart_threshold: i32,
    #[serde(default)]
    pub including_init_containers: bool,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
}

pub struct TooManyRestarts {
    args: TooManyRestartsArgs,
    scope: PodScope,
}

pub fn new(args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: TooManyRestartsArgs = decode_args(NAME, args)?;
    if args.pod_restart_threshold < 1 {
        return Err(ConfigError::invalid_args(
            NAME,
            "podRestartThreshold must be greater than 0",
        ));
    }
    let scope = PodScope::new(NAME, args.namespaces.clone(), args.label_selector.clone())?;
    Ok(PluginInstance::new(NAME).with_deschedule(Arc::new(TooManyRestarts { args, scope })))
}

impl Plugin for TooManyRestarts {
    fn name(&self) -> &str {
        NAME
    }
}

impl DeschedulePlugin for TooManyRestarts {
    fn deschedule(&self, node: &Node, cycle: &CycleContext<'_>) -> Result<Nominations, PluginError> {
        Ok(cycle
            .snapshot()
            .pods_on(&node.name)
            .iter()
            .filter(|pod| self.scope.contains(pod))
            .filter(|pod| {
                pod.restarts(self.args.including_init_containers) >= self.args.pod_restart_threshold
            })
            .map(|pod| Nomination::Evict(pod.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterSnapshot;
    use crate::framework::FilterChain;
    use crate::models::{ContainerStatus, Pod, ResourceList};
    use chrono::Utc;
    use serde_json::json;

    fn restarting(name: &str, app: i32, init: i32) -> Pod {
        let mut pod = Pod::new("default", name).on_node("n1");
        pod.container_statuses.push(ContainerStatus {
            name: "app".to_string(),
            restart_count: app,
            ..Default::default()
        });
        pod.init_container_statuses.push(ContainerStatus {
            name: "init".to_string(),
            restart_count: init,
            ..Default::default()
        });
        pod
    }

    fn nominated(args: serde_json::Value, pods: Vec<Pod>) -> Vec<String> {
        let node = Node::new("n1", ResourceList::new(4000, 8 << 30, 110));
        let handle = Handle::from_snapshot(ClusterSnapshot::new(
            vec![node.clone()],
            pods,
            Vec::new(),
            Utc::now(),
        ));
        let plugin = new(&args, &handle).unwrap().deschedule.clone().unwrap();
        let filter = FilterChain::empty();
        plugin
            .deschedule(&node, &CycleContext::new(&handle, &filter))
            .unwrap()
            .into_iter()
            .map(|n| match n {
                Nomination::Evict(p) | Nomination::Hold(p, _) => p.name,
            })
            .collect()
    }

    #[test]
    fn test_threshold() {
        let pods = vec![restarting("calm", 1, 0), restarting("crashy", 5, 0)];
        assert_eq!(nominated(json!({"podRestartThreshold": 5}), pods), vec!["crashy"]);
    }

    #[test]
    fn test_including_init_containers() {
        let pods = vec![restarting("a", 2, 3)];
        assert!(nominated(json!({"podRestartThreshold": 5}), pods.clone()).is_empty());
        assert_eq!(
            nominated(
                json!({"podRestartThreshold": 5, "includingInitContainers": true}),
                pods
            ),
            vec!["a"]
        );
    }

    #[test]
    fn test_threshold_must_be_positive() {
        assert!(matches!(
            new(&json!({}), &Handle::empty()),
            Err(ConfigError::InvalidArgs { .. })
        ));
    }
}
