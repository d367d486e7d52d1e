//! Descheduler library
//!
//! This crate provides the core functionality for:
//! - The descheduler policy document and its validation
//! - A plugin framework with six extension points and a built-in plugin set
//! - A budgeted eviction engine enforcing per-node, per-namespace and total ceilings
//! - Cluster and utilization adapters for Kubernetes
//! - The descheduling loop, health checks and observability

pub mod api;
pub mod cluster;
pub mod descheduler;
pub mod error;
pub mod evictions;
pub mod framework;
pub mod health;
pub mod models;
pub mod observability;
pub mod plugins;
pub mod summary;
pub mod utilization;

pub use api::{ExtensionPoint, Policy, PolicyError, Profile};
pub use cluster::{ClusterSnapshot, SnapshotError, SnapshotSource, StaticSnapshotSource};
pub use descheduler::{Descheduler, DeschedulerOptions};
pub use error::{ConfigError, PluginError};
pub use evictions::{
    EvictError, EvictionBudget, EvictionLimits, EvictionMode, EvictionOutcome, Evictor,
    FailureReason, RecordingEvictor, SkipReason,
};
pub use framework::{Cancellation, Handle, ProfileExecutor, Registry};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{DeschedulerMetrics, StructuredLogger};
pub use summary::RunSummary;
