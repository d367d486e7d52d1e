//! Filter chains
//!
//! A chain is the logical AND of its plugins' verdicts, evaluated in profile
//! order and short-circuiting on the first rejection. The final admit/reject
//! decision does not depend on plugin order; only the reported rejecting
//! plugin does.

use super::types::{FilterPlugin, Plugin, PreEvictionFilterPlugin, Verdict};
use crate::models::Pod;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn FilterPlugin>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn FilterPlugin>>) -> Self {
        Self { filters }
    }

    /// Chain that admits every pod
    pub fn empty() -> Self {
        Self::default()
    }

    /// Chain over PreEvictionFilter plugins
    pub fn pre_eviction(filters: Vec<Arc<dyn PreEvictionFilterPlugin>>) -> Self {
        Self {
            filters: filters
                .into_iter()
                .map(|f| Arc::new(PreEviction(f)) as Arc<dyn FilterPlugin>)
                .collect(),
        }
    }

    pub fn evaluate(&self, pod: &Pod) -> Verdict {
        for filter in &self.filters {
            let verdict = filter.filter(pod);
            if !verdict.is_admit() {
                return verdict;
            }
        }
        Verdict::Admit
    }

    pub fn is_evictable(&self, pod: &Pod) -> bool {
        self.evaluate(pod).is_admit()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.names())
            .finish()
    }
}

struct PreEviction(Arc<dyn PreEvictionFilterPlugin>);

impl Plugin for PreEviction {
    fn name(&self) -> &str {
        self.0.name()
    }
}

impl FilterPlugin for PreEviction {
    fn filter(&self, pod: &Pod) -> Verdict {
        self.0.pre_evict(pod)
    }
}
