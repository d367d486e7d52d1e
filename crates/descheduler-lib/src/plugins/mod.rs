//! Built-in strategy plugins

pub mod default_evictor;
pub mod low_node_utilization;
pub mod node_free_capacity;
pub mod pod_lifetime;
pub mod remove_duplicates;
pub mod remove_failed_pods;
pub mod too_many_restarts;

use crate::error::ConfigError;
use crate::framework::Registry;
use crate::models::{LabelSelector, Pod};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Registry holding every built-in plugin
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            default_evictor::NAME,
            default_evictor::CAPABILITIES,
            default_evictor::new,
        )
        .register(
            remove_failed_pods::NAME,
            remove_failed_pods::CAPABILITIES,
            remove_failed_pods::new,
        )
        .register(
            too_many_restarts::NAME,
            too_many_restarts::CAPABILITIES,
            too_many_restarts::new,
        )
        .register(pod_lifetime::NAME, pod_lifetime::CAPABILITIES, pod_lifetime::new)
        .register(
            remove_duplicates::NAME,
            remove_duplicates::CAPABILITIES,
            remove_duplicates::new,
        )
        .register(
            low_node_utilization::NAME,
            low_node_utilization::CAPABILITIES,
            low_node_utilization::new,
        )
        .register(
            node_free_capacity::NAME,
            node_free_capacity::CAPABILITIES,
            node_free_capacity::new,
        );
    registry
}

/// Seconds from plugin args as a duration, clamped to what chrono can hold
pub(crate) fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64)
}

/// Namespace include/exclude lists; at most one may be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Namespaces {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Namespaces {
    pub fn allows(&self, namespace: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|n| n == namespace);
        }
        !self.exclude.iter().any(|n| n == namespace)
    }

    pub(crate) fn validate(&self, plugin: &str) -> Result<(), ConfigError> {
        if !self.include.is_empty() && !self.exclude.is_empty() {
            return Err(ConfigError::invalid_args(
                plugin,
                "only one of namespaces.include and namespaces.exclude can be set",
            ));
        }
        Ok(())
    }
}

/// Namespace and label scoping shared by the pod-inspecting plugins
#[derive(Debug, Clone, Default)]
pub(crate) struct PodScope {
    pub namespaces: Option<Namespaces>,
    pub label_selector: Option<LabelSelector>,
}

impl PodScope {
    pub fn new(
        plugin: &str,
        namespaces: Option<Namespaces>,
        label_selector: Option<LabelSelector>,
    ) -> Result<Self, ConfigError> {
        if let Some(namespaces) = &namespaces {
            namespaces.validate(plugin)?;
        }
        Ok(Self {
            namespaces,
            label_selector,
        })
    }

    pub fn contains(&self, pod: &Pod) -> bool {
        let namespace_ok = self
            .namespaces
            .as_ref()
            .map(|n| n.allows(&pod.namespace))
            .unwrap_or(true);
        let labels_ok = self
            .label_selector
            .as_ref()
            .map(|s| s.matches(&pod.labels))
            .unwrap_or(true);
        namespace_ok && labels_ok
    }
}
