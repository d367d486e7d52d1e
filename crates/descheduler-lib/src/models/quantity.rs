//! Kubernetes resource quantity parsing
//!
//! Quantities arrive as strings such as `250m`, `1.5`, `512Mi` or `1e3`.
//! CPU is normalized to millicores and memory to bytes.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity string into its base-unit value
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(value) = s.parse::<f64>() {
        return Some(value);
    }

    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES) {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|v| v * factor);
        }
    }

    None
}

/// Parse a CPU quantity into millicores
pub fn parse_cpu_millis(raw: &str) -> Option<i64> {
    parse_quantity(raw).map(|cores| (cores * 1000.0).ceil() as i64)
}

/// Parse a memory quantity into bytes
pub fn parse_bytes(raw: &str) -> Option<i64> {
    parse_quantity(raw).map(|bytes| bytes.round() as i64)
}

/// Resource dimensions the descheduler reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
    Pods,
}

impl ResourceName {
    pub const ALL: [ResourceName; 3] = [ResourceName::Cpu, ResourceName::Memory, ResourceName::Pods];
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceName::Cpu => write!(f, "cpu"),
            ResourceName::Memory => write!(f, "memory"),
            ResourceName::Pods => write!(f, "pods"),
        }
    }
}

/// A set of resource amounts (requests, allocatable or observed usage)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    pub pods: i64,
}

impl ResourceList {
    pub fn new(cpu_millis: i64, memory_bytes: i64, pods: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            pods,
        }
    }

    pub fn get(&self, resource: ResourceName) -> i64 {
        match resource {
            ResourceName::Cpu => self.cpu_millis,
            ResourceName::Memory => self.memory_bytes,
            ResourceName::Pods => self.pods,
        }
    }

    pub fn set(&mut self, resource: ResourceName, value: i64) {
        match resource {
            ResourceName::Cpu => self.cpu_millis = value,
            ResourceName::Memory => self.memory_bytes = value,
            ResourceName::Pods => self.pods = value,
        }
    }

    /// Component-wise subtraction clamped at zero
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis).max(0),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes).max(0),
            pods: self.pods.saturating_sub(other.pods).max(0),
        }
    }

    /// True when every dimension of `self` fits into `capacity`
    pub fn fits_in(&self, capacity: &ResourceList) -> bool {
        ResourceName::ALL
            .iter()
            .all(|r| self.get(*r) <= capacity.get(*r))
    }
}

impl Add for ResourceList {
    type Output = ResourceList;

    fn add(self, rhs: ResourceList) -> ResourceList {
        ResourceList {
            cpu_millis: self.cpu_millis.saturating_add(rhs.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(rhs.memory_bytes),
            pods: self.pods.saturating_add(rhs.pods),
        }
    }
}

impl AddAssign for ResourceList {
    fn add_assign(&mut self, rhs: ResourceList) {
        *self = *self + rhs;
    }
}
