//! Per-cycle eviction counters
//!
//! Ceilings are enforced against committed evictions plus in-flight
//! reservations, so concurrent node tasks can never overshoot a ceiling.
//! Committed counts only ever grow until [`EvictionCounters::reset`].

use super::SkipReason;
use crate::api::Policy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Configured eviction ceilings; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionLimits {
    pub per_node: Option<u32>,
    pub per_namespace: Option<u32>,
    pub total: Option<u32>,
}

impl EvictionLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Ceilings configured in the policy
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            per_node: policy.max_no_of_pods_to_evict_per_node,
            per_namespace: policy.max_no_of_pods_to_evict_per_namespace,
            total: policy.max_no_of_pods_to_evict_total,
        }
    }
}

/// A slot held for one in-flight eviction
#[derive(Debug)]
pub struct Reservation {
    node: String,
    namespace: String,
    uid: String,
}

#[derive(Debug, Default)]
struct ScopeCount {
    committed: u32,
    reserved: u32,
}

impl ScopeCount {
    fn has_room(&self, limit: Option<u32>) -> bool {
        limit
            .map(|max| self.committed + self.reserved < max)
            .unwrap_or(true)
    }
}

#[derive(Debug, Default)]
pub struct EvictionCounters {
    per_node: HashMap<String, ScopeCount>,
    per_namespace: HashMap<String, ScopeCount>,
    total: ScopeCount,
    evicted: HashSet<String>,
    in_flight: HashSet<String>,
}

impl EvictionCounters {
    /// Take a slot in all three scopes, or report which ceiling blocks it
    pub fn reserve(
        &mut self,
        limits: &EvictionLimits,
        node: &str,
        namespace: &str,
        uid: &str,
    ) -> Result<Reservation, SkipReason> {
        if self.evicted.contains(uid) || self.in_flight.contains(uid) {
            return Err(SkipReason::AlreadyEvicted);
        }

        let node_ok = self
            .per_node
            .get(node)
            .map(|c| c.has_room(limits.per_node))
            .unwrap_or(limits.per_node != Some(0));
        if !node_ok {
            return Err(SkipReason::NodeCeilingReached);
        }

        let namespace_ok = self
            .per_namespace
            .get(namespace)
            .map(|c| c.has_room(limits.per_namespace))
            .unwrap_or(limits.per_namespace != Some(0));
        if !namespace_ok {
            return Err(SkipReason::NamespaceCeilingReached);
        }

        if !self.total.has_room(limits.total) {
            return Err(SkipReason::TotalCeilingReached);
        }

        self.per_node.entry(node.to_string()).or_default().reserved += 1;
        self.per_namespace
            .entry(namespace.to_string())
            .or_default()
            .reserved += 1;
        self.total.reserved += 1;
        self.in_flight.insert(uid.to_string());

        Ok(Reservation {
            node: node.to_string(),
            namespace: namespace.to_string(),
            uid: uid.to_string(),
        })
    }

    /// Turn a reservation into a counted eviction
    pub fn commit(&mut self, reservation: Reservation) {
        self.unreserve(&reservation);
        if let Some(c) = self.per_node.get_mut(&reservation.node) {
            c.committed += 1;
        }
        if let Some(c) = self.per_namespace.get_mut(&reservation.namespace) {
            c.committed += 1;
        }
        self.total.committed += 1;
        self.evicted.insert(reservation.uid);
    }

    /// Give a reservation back without counting it
    pub fn release(&mut self, reservation: Reservation) {
        self.unreserve(&reservation);
    }

    fn unreserve(&mut self, reservation: &Reservation) {
        if let Some(c) = self.per_node.get_mut(&reservation.node) {
            c.reserved = c.reserved.saturating_sub(1);
        }
        if let Some(c) = self.per_namespace.get_mut(&reservation.namespace) {
            c.reserved = c.reserved.saturating_sub(1);
        }
        self.total.reserved = self.total.reserved.saturating_sub(1);
        self.in_flight.remove(&reservation.uid);
    }

    pub fn on_node(&self, node: &str) -> u32 {
        self.per_node.get(node).map(|c| c.committed).unwrap_or(0)
    }

    pub fn in_namespace(&self, namespace: &str) -> u32 {
        self.per_namespace
            .get(namespace)
            .map(|c| c.committed)
            .unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.total.committed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
