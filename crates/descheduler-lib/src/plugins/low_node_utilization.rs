//! LowNodeUtilization: move pods off overutilized nodes while underutilized
//! nodes have room for them
//!
//! A node is underutilized when every resource is at or below `thresholds`
//! and overutilized when any resource is above `targetThresholds`. The room
//! available on underutilized nodes (up to the target) is computed once per
//! cycle; pods are nominated from overutilized nodes, lowest priority first,
//! until the node drops below the target or the room runs out.

use super::Namespaces;
use crate::api::ExtensionPoint;
use crate::error::{ConfigError, PluginError};
use crate::framework::{
    decode_args, BalancePlugin, BalanceRound, CycleContext, Handle, Nomination, Nominations,
    Plugin, PluginInstance,
};
use crate::models::{Node, Pod, PodPhase, ResourceList, ResourceName};
use crate::utilization::NodeUtilization;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const NAME: &str = "LowNodeUtilization";

pub(crate) const CAPABILITIES: &[ExtensionPoint] = &[ExtensionPoint::Balance];

const MAX_PERCENTAGE: f64 = 100.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LowNodeUtilizationArgs {
    #[serde(default)]
    pub thresholds: BTreeMap<ResourceName, f64>,
    #[serde(default)]
    pub target_thresholds: BTreeMap<ResourceName, f64>,
    /// Minimum number of underutilized nodes before anything is evicted
    #[serde(default)]
    pub number_of_nodes: usize,
    #[serde(default)]
    pub evictable_namespaces: Option<Namespaces>,
}

pub struct LowNodeUtilization {
    thresholds: BTreeMap<ResourceName, f64>,
    target_thresholds: BTreeMap<ResourceName, f64>,
    number_of_nodes: usize,
    evictable_namespaces: Option<Namespaces>,
}

pub fn new(args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: LowNodeUtilizationArgs = decode_args(NAME, args)?;
    let plugin = LowNodeUtilization::new(args)?;
    Ok(PluginInstance::new(NAME).with_balance(Arc::new(plugin)))
}

fn validate_percentages(
    field: &str,
    values: &BTreeMap<ResourceName, f64>,
) -> Result<(), ConfigError> {
    if values.is_empty() {
        return Err(ConfigError::invalid_args(NAME, format!("{field} must be set")));
    }
    for (resource, value) in values {
        if !(0.0..=MAX_PERCENTAGE).contains(value) {
            return Err(ConfigError::invalid_args(
                NAME,
                format!("{field}.{resource} must be between 0 and 100, got {value}"),
            ));
        }
    }
    Ok(())
}

impl LowNodeUtilization {
    pub fn new(args: LowNodeUtilizationArgs) -> Result<Self, ConfigError> {
        validate_percentages("thresholds", &args.thresholds)?;
        validate_percentages("targetThresholds", &args.target_thresholds)?;

        if !args.thresholds.keys().eq(args.target_thresholds.keys()) {
            return Err(ConfigError::invalid_args(
                NAME,
                "thresholds and targetThresholds must configure the same resources",
            ));
        }
        for (resource, low) in &args.thresholds {
            if *low > args.target_thresholds[resource] {
                return Err(ConfigError::invalid_args(
                    NAME,
                    format!("thresholds.{resource} must not exceed targetThresholds.{resource}"),
                ));
            }
        }
        if let Some(namespaces) = &args.evictable_namespaces {
            namespaces.validate(NAME)?;
        }

        let mut thresholds = args.thresholds;
        let mut target_thresholds = args.target_thresholds;
        for resource in ResourceName::ALL {
            thresholds.entry(resource).or_insert(MAX_PERCENTAGE);
            target_thresholds.entry(resource).or_insert(MAX_PERCENTAGE);
        }

        Ok(Self {
            thresholds,
            target_thresholds,
            number_of_nodes: args.number_of_nodes,
            evictable_namespaces: args.evictable_namespaces,
        })
    }

    fn is_underutilized(&self, node: &Node, usage: &NodeUtilization) -> bool {
        node.is_schedulable()
            && self
                .thresholds
                .iter()
                .all(|(resource, limit)| usage.percent(*resource) <= *limit)
    }

    fn is_overutilized(&self, usage: &NodeUtilization) -> bool {
        self.target_thresholds
            .iter()
            .any(|(resource, limit)| usage.percent(*resource) > *limit)
    }

    fn movable(&self, pod: &Pod, cycle: &CycleContext<'_>) -> bool {
        !matches!(pod.phase, PodPhase::Succeeded | PodPhase::Failed)
            && self
                .evictable_namespaces
                .as_ref()
                .map(|n| n.allows(&pod.namespace))
                .unwrap_or(true)
            && cycle.is_evictable(pod)
    }
}

impl Plugin for LowNodeUtilization {
    fn name(&self) -> &str {
        NAME
    }
}

impl BalancePlugin for LowNodeUtilization {
    fn plan<'a>(&'a self, cycle: &CycleContext<'_>) -> Result<Box<dyn BalanceRound + 'a>, PluginError> {
        let nodes = cycle.snapshot().nodes();
        let mut underutilized = Vec::new();
        let mut overutilized = HashMap::new();

        for node in nodes {
            let Some(usage) = cycle.usage().get(&node.name) else {
                continue;
            };
            if self.is_underutilized(node, usage) {
                underutilized.push((node, usage));
            } else if self.is_overutilized(usage) {
                overutilized.insert(node.name.clone(), usage.clone());
            }
        }

        debug!(
            underutilized = underutilized.len(),
            overutilized = overutilized.len(),
            total = nodes.len(),
            "Classified nodes by utilization"
        );

        if underutilized.is_empty()
            || underutilized.len() <= self.number_of_nodes
            || underutilized.len() == nodes.len()
            || overutilized.is_empty()
        {
            return Ok(Box::new(UtilizationRound::idle(self)));
        }

        let mut available = ResourceList::default();
        for (_, usage) in &underutilized {
            for resource in ResourceName::ALL {
                let target = usage.allocatable.get(resource) as f64
                    * self.target_thresholds[&resource]
                    / MAX_PERCENTAGE;
                let room = (target as i64 - usage.usage.get(resource)).max(0);
                available.set(resource, available.get(resource) + room);
            }
        }

        Ok(Box::new(UtilizationRound {
            plugin: self,
            available,
            overutilized,
        }))
    }
}

struct UtilizationRound<'a> {
    plugin: &'a LowNodeUtilization,
    /// Remaining room on underutilized nodes
    available: ResourceList,
    overutilized: HashMap<String, NodeUtilization>,
}

impl<'a> UtilizationRound<'a> {
    fn idle(plugin: &'a LowNodeUtilization) -> Self {
        Self {
            plugin,
            available: ResourceList::default(),
            overutilized: HashMap::new(),
        }
    }

    fn has_room(&self) -> bool {
        ResourceName::ALL
            .iter()
            .all(|resource| self.available.get(*resource) > 0)
    }
}

impl BalanceRound for UtilizationRound<'_> {
    fn balance(&mut self, node: &Node, cycle: &CycleContext<'_>) -> Result<Nominations, PluginError> {
        let Some(mut usage) = self.overutilized.remove(&node.name) else {
            return Ok(Vec::new());
        };

        let mut movable: Vec<&Pod> = cycle
            .snapshot()
            .pods_on(&node.name)
            .iter()
            .filter(|pod| self.plugin.movable(pod, cycle))
            .collect();
        movable.sort_by_key(|pod| pod.priority.unwrap_or(0));

        let mut nominations = Vec::new();
        for pod in movable {
            if !self.plugin.is_overutilized(&usage) || !self.has_room() {
                break;
            }
            let requests = pod.requests();
            usage.usage = usage.usage.saturating_sub(&requests);
            self.available = self.available.saturating_sub(&requests);
            nominations.push(Nomination::Evict(pod.clone()));
        }

        debug!(
            node = %node.name,
            nominated = nominations.len(),
            "Balanced overutilized node"
        );
        Ok(nominations)
    }

    fn satisfied(&self) -> bool {
        self.overutilized.is_empty() || !self.has_room()
    }
}
