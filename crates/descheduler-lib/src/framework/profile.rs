use super::cancel::Cancellation;
use super::filter::FilterChain;
use super::handle::Handle;
use super::pipeline::{EvictionStage, NominationStage, OrderingStage};
use super::registry::Registry;
use super::types::{
    BalancePlugin, CandidateResult, CycleContext, DeschedulePlugin, PluginInstance, PreSortPlugin,
    SortPlugin,
};
use crate::api::{ExtensionPoint, Profile};
use crate::error::ConfigError;
use crate::evictions::EvictionBudget;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Execution knobs shared by every profile of a cycle
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Node batches evicted concurrently; 1 is fully sequential
    pub max_parallel_nodes: usize,
    pub cancel: Cancellation,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 1,
            cancel: Cancellation::none(),
        }
    }
}

/// What one profile run produced
#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    pub profile: String,
    pub nodes_considered: usize,
    pub results: Vec<CandidateResult>,
}

/// A profile with its plugins instantiated and assigned to stages
pub struct ProfileExecutor {
    name: String,
    pre_sort: Vec<Arc<dyn PreSortPlugin>>,
    sort: Vec<Arc<dyn SortPlugin>>,
    deschedule: Vec<Arc<dyn DeschedulePlugin>>,
    balance: Vec<Arc<dyn BalancePlugin>>,
    filter: FilterChain,
    pre_eviction: FilterChain,
}

impl ProfileExecutor {
    /// Instantiate every referenced plugin and check each stage assignment
    /// against the plugin's capabilities
    pub fn build(profile: &Profile, registry: &Registry, handle: &Handle) -> Result<Self, ConfigError> {
        profile.validate()?;

        let mut instances: HashMap<&str, PluginInstance> = HashMap::new();
        for name in profile.enabled_plugins() {
            let args = profile
                .args_for(name)
                .ok_or_else(|| ConfigError::MissingPluginConfig {
                    profile: profile.name.clone(),
                    plugin: name.to_string(),
                })?;
            let instance = registry.instantiate(&profile.name, name, args, handle)?;
            instances.insert(name, instance);
        }

        let mut executor = Self {
            name: profile.name.clone(),
            pre_sort: Vec::new(),
            sort: Vec::new(),
            deschedule: Vec::new(),
            balance: Vec::new(),
            filter: FilterChain::empty(),
            pre_eviction: FilterChain::empty(),
        };
        let mut filters = Vec::new();
        let mut pre_eviction = Vec::new();

        for point in ExtensionPoint::ALL {
            for name in profile.plugins.stage(point).effective() {
                let instance = &instances[name];
                let mismatch = || ConfigError::CapabilityMismatch {
                    profile: profile.name.clone(),
                    plugin: name.to_string(),
                    stage: point,
                };
                match point {
                    ExtensionPoint::PreSort => {
                        executor.pre_sort.push(instance.pre_sort.clone().ok_or_else(mismatch)?)
                    }
                    ExtensionPoint::Sort => {
                        executor.sort.push(instance.sort.clone().ok_or_else(mismatch)?)
                    }
                    ExtensionPoint::Deschedule => executor
                        .deschedule
                        .push(instance.deschedule.clone().ok_or_else(mismatch)?),
                    ExtensionPoint::Balance => {
                        executor.balance.push(instance.balance.clone().ok_or_else(mismatch)?)
                    }
                    ExtensionPoint::Filter => {
                        filters.push(instance.filter.clone().ok_or_else(mismatch)?)
                    }
                    ExtensionPoint::PreEvictionFilter => pre_eviction.push(
                        instance
                            .pre_eviction_filter
                            .clone()
                            .ok_or_else(mismatch)?,
                    ),
                }
            }
        }

        executor.filter = FilterChain::new(filters);
        executor.pre_eviction = FilterChain::pre_eviction(pre_eviction);

        debug!(
            profile = %executor.name,
            deschedule = executor.deschedule.len(),
            balance = executor.balance.len(),
            filters = executor.filter.len(),
            "Profile built"
        );
        Ok(executor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter_chain(&self) -> &FilterChain {
        &self.filter
    }

    /// Run the pipeline once against the handle's snapshot
    pub async fn run(
        &self,
        handle: &Handle,
        budget: Arc<EvictionBudget>,
        options: &ExecutionOptions,
    ) -> ProfileReport {
        let cycle = CycleContext::new(handle, &self.filter);

        let ordering = OrderingStage {
            profile: &self.name,
            pre_sort: &self.pre_sort,
            sort: &self.sort,
        };
        let nodes = ordering.run(handle.snapshot().nodes(), &cycle);

        let nomination = NominationStage {
            profile: &self.name,
            deschedule: &self.deschedule,
            balance: &self.balance,
        };
        let batches = nomination.run(&nodes, &cycle);
        let nominated: usize = batches.iter().map(|b| b.entries.len()).sum();

        let eviction = EvictionStage {
            filter: self.filter.clone(),
            pre_eviction: self.pre_eviction.clone(),
            budget,
            max_parallel_nodes: options.max_parallel_nodes,
        };
        let results = eviction.run(batches, &options.cancel).await;

        info!(
            profile = %self.name,
            nodes = nodes.len(),
            candidates = nominated,
            "Profile run completed"
        );

        ProfileReport {
            profile: self.name.clone(),
            nodes_considered: nodes.len(),
            results,
        }
    }
}
