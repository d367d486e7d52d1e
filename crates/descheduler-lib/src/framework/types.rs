//! Plugin capability traits and the values flowing between pipeline stages

use crate::api::ExtensionPoint;
use crate::cluster::ClusterSnapshot;
use crate::error::PluginError;
use crate::evictions::{EvictionOutcome, SkipReason};
use crate::models::{Node, Pod};
use crate::utilization::UtilizationIndex;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::filter::FilterChain;
use super::handle::Handle;

/// A pod nominated for eviction by a profile's plugin
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub pod: Pod,
    /// Node the pod runs on
    pub node: String,
    pub profile: String,
    pub plugin: String,
}

impl Candidate {
    pub fn new(
        pod: Pod,
        node: impl Into<String>,
        profile: impl Into<String>,
        plugin: impl Into<String>,
    ) -> Self {
        Self {
            pod,
            node: node.into(),
            profile: profile.into(),
            plugin: plugin.into(),
        }
    }
}

/// What a Deschedule or Balance plugin decided about one inspected pod
#[derive(Debug, Clone, PartialEq)]
pub enum Nomination {
    Evict(Pod),
    /// Inspected and matched, but not evictable yet
    Hold(Pod, SkipReason),
}

pub type Nominations = Vec<Nomination>;

/// Admissibility verdict of a filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject { plugin: String, reason: String },
}

impl Verdict {
    pub fn reject(plugin: &str, reason: impl Into<String>) -> Self {
        Verdict::Reject {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }
}

/// Auxiliary per-node values computed by PreSort plugins for Sort plugins
#[derive(Debug, Clone, Default)]
pub struct SortKeys {
    values: HashMap<String, HashMap<String, f64>>,
}

impl SortKeys {
    pub fn set(&mut self, node: &str, key: &str, value: f64) {
        self.values
            .entry(node.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, node: &str, key: &str) -> Option<f64> {
        self.values.get(node).and_then(|keys| keys.get(key)).copied()
    }
}

/// Read-only view handed to plugins on every call
pub struct CycleContext<'a> {
    pub handle: &'a Handle,
    pub filter: &'a FilterChain,
}

impl<'a> CycleContext<'a> {
    pub fn new(handle: &'a Handle, filter: &'a FilterChain) -> Self {
        Self { handle, filter }
    }

    pub fn snapshot(&self) -> &ClusterSnapshot {
        self.handle.snapshot()
    }

    pub fn usage(&self) -> &UtilizationIndex {
        self.handle.usage()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.handle.now()
    }

    /// Whether the profile's filter chain admits the pod
    pub fn is_evictable(&self, pod: &Pod) -> bool {
        self.filter.is_evictable(pod)
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

/// Computes sort keys once per cycle before node ordering
pub trait PreSortPlugin: Plugin {
    fn pre_sort(&self, cycle: &CycleContext<'_>, keys: &mut SortKeys) -> Result<(), PluginError>;
}

/// Contributes one comparator to the node order
pub trait SortPlugin: Plugin {
    fn compare(&self, a: &Node, b: &Node, keys: &SortKeys) -> Ordering;
}

/// Inspects the pods of one node in isolation
pub trait DeschedulePlugin: Plugin {
    fn deschedule(&self, node: &Node, cycle: &CycleContext<'_>) -> Result<Nominations, PluginError>;
}

/// Works against a cluster-wide target computed once per cycle
pub trait BalancePlugin: Plugin {
    fn plan<'a>(&'a self, cycle: &CycleContext<'_>) -> Result<Box<dyn BalanceRound + 'a>, PluginError>;
}

/// Per-cycle state of a balance plugin
pub trait BalanceRound: Send {
    fn balance(&mut self, node: &Node, cycle: &CycleContext<'_>) -> Result<Nominations, PluginError>;

    /// Once satisfied, the round is not called for the remaining nodes
    fn satisfied(&self) -> bool {
        false
    }
}

/// Decides whether a pod may legally be evicted
pub trait FilterPlugin: Plugin {
    fn filter(&self, pod: &Pod) -> Verdict;
}

/// Last check right before the removal call
pub trait PreEvictionFilterPlugin: Plugin {
    fn pre_evict(&self, pod: &Pod) -> Verdict;
}

/// A constructed plugin, with one slot per capability it implements
#[derive(Clone, Default)]
pub struct PluginInstance {
    name: String,
    pub(crate) pre_sort: Option<Arc<dyn PreSortPlugin>>,
    pub(crate) sort: Option<Arc<dyn SortPlugin>>,
    pub(crate) deschedule: Option<Arc<dyn DeschedulePlugin>>,
    pub(crate) balance: Option<Arc<dyn BalancePlugin>>,
    pub(crate) filter: Option<Arc<dyn FilterPlugin>>,
    pub(crate) pre_eviction_filter: Option<Arc<dyn PreEvictionFilterPlugin>>,
}

impl PluginInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_pre_sort(mut self, plugin: Arc<dyn PreSortPlugin>) -> Self {
        self.pre_sort = Some(plugin);
        self
    }

    pub fn with_sort(mut self, plugin: Arc<dyn SortPlugin>) -> Self {
        self.sort = Some(plugin);
        self
    }

    pub fn with_deschedule(mut self, plugin: Arc<dyn DeschedulePlugin>) -> Self {
        self.deschedule = Some(plugin);
        self
    }

    pub fn with_balance(mut self, plugin: Arc<dyn BalancePlugin>) -> Self {
        self.balance = Some(plugin);
        self
    }

    pub fn with_filter(mut self, plugin: Arc<dyn FilterPlugin>) -> Self {
        self.filter = Some(plugin);
        self
    }

    pub fn with_pre_eviction_filter(mut self, plugin: Arc<dyn PreEvictionFilterPlugin>) -> Self {
        self.pre_eviction_filter = Some(plugin);
        self
    }

    pub fn supports(&self, point: ExtensionPoint) -> bool {
        match point {
            ExtensionPoint::PreSort => self.pre_sort.is_some(),
            ExtensionPoint::Sort => self.sort.is_some(),
            ExtensionPoint::Deschedule => self.deschedule.is_some(),
            ExtensionPoint::Balance => self.balance.is_some(),
            ExtensionPoint::Filter => self.filter.is_some(),
            ExtensionPoint::PreEvictionFilter => self.pre_eviction_filter.is_some(),
        }
    }

    pub fn capabilities(&self) -> Vec<ExtensionPoint> {
        ExtensionPoint::ALL
            .into_iter()
            .filter(|p| self.supports(*p))
            .collect()
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Final outcome of one candidate in a cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateResult {
    pub candidate: Candidate,
    pub outcome: EvictionOutcome,
}
