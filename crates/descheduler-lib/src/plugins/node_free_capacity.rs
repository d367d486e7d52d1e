//! NodeFreeCapacity: order nodes by unused cpu and memory
//!
//! With the default ascending order the most loaded nodes are visited first,
//! so Balance plugins and eviction ceilings favour them.

use crate::api::ExtensionPoint;
use crate::error::{ConfigError, PluginError};
use crate::framework::{
    decode_args, CycleContext, Handle, Plugin, PluginInstance, PreSortPlugin, SortKeys,
    SortPlugin,
};
use crate::models::{Node, ResourceName};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

pub const NAME: &str = "NodeFreeCapacity";

pub(crate) const CAPABILITIES: &[ExtensionPoint] = &[ExtensionPoint::PreSort, ExtensionPoint::Sort];

const FREE_CAPACITY_KEY: &str = "free-capacity";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeFreeCapacityArgs {
    #[serde(default)]
    pub order: SortOrder,
}

pub struct NodeFreeCapacity {
    order: SortOrder,
}

pub fn new(args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    let args: NodeFreeCapacityArgs = decode_args(NAME, args)?;
    let plugin = Arc::new(NodeFreeCapacity { order: args.order });
    Ok(PluginInstance::new(NAME)
        .with_pre_sort(plugin.clone())
        .with_sort(plugin))
}

impl Plugin for NodeFreeCapacity {
    fn name(&self) -> &str {
        NAME
    }
}

impl PreSortPlugin for NodeFreeCapacity {
    fn pre_sort(&self, cycle: &CycleContext<'_>, keys: &mut SortKeys) -> Result<(), PluginError> {
        for node in cycle.snapshot().nodes() {
            let usage = cycle.usage().get(&node.name).ok_or_else(|| {
                PluginError::new(NAME, format!("no utilization recorded for node {}", node.name))
            })?;
            let free: f64 = [ResourceName::Cpu, ResourceName::Memory]
                .iter()
                .map(|r| (100.0 - usage.percent(*r)).max(0.0))
                .sum();
            keys.set(&node.name, FREE_CAPACITY_KEY, free / 2.0);
        }
        Ok(())
    }
}

impl SortPlugin for NodeFreeCapacity {
    fn compare(&self, a: &Node, b: &Node, keys: &SortKeys) -> Ordering {
        let free_a = keys.get(&a.name, FREE_CAPACITY_KEY).unwrap_or(0.0);
        let free_b = keys.get(&b.name, FREE_CAPACITY_KEY).unwrap_or(0.0);
        let ordering = free_a.partial_cmp(&free_b).unwrap_or(Ordering::Equal);
        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}
