//! Observability infrastructure for the descheduler
//!
//! Provides:
//! - Prometheus metrics (evictions by result, cycle duration, candidate counts, errors)
//! - Structured JSON logging with tracing

use crate::evictions::SkipReason;
use crate::framework::Candidate;
use crate::summary::RunSummary;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter_vec, register_int_gauge_vec,
    GaugeVec, Histogram, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle duration (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DeschedulerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct DeschedulerMetricsInner {
    pods_evicted: IntCounterVec,
    cycle_duration_seconds: Histogram,
    cycle_candidates: IntGaugeVec,
    profile_errors: IntCounterVec,
    plugin_errors: IntCounterVec,
    build_info: GaugeVec,
}

impl DeschedulerMetricsInner {
    fn new() -> Self {
        Self {
            pods_evicted: register_int_counter_vec!(
                "descheduler_pods_evicted_total",
                "Number of eviction attempts by result (success, dry-run, error), strategy, profile, namespace and node",
                &["result", "strategy", "profile", "namespace", "node"]
            )
            .expect("Failed to register pods_evicted_total"),

            cycle_duration_seconds: register_histogram!(
                "descheduler_cycle_duration_seconds",
                "Time spent running one descheduling cycle across all profiles",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            cycle_candidates: register_int_gauge_vec!(
                "descheduler_cycle_candidates",
                "Candidates processed in the last cycle by outcome",
                &["outcome"]
            )
            .expect("Failed to register cycle_candidates"),

            profile_errors: register_int_counter_vec!(
                "descheduler_profile_config_errors_total",
                "Profiles that could not be built due to configuration errors",
                &["profile"]
            )
            .expect("Failed to register profile_config_errors_total"),

            plugin_errors: register_int_counter_vec!(
                "descheduler_plugin_errors_total",
                "Plugin evaluation errors recovered at the plugin boundary",
                &["plugin", "stage"]
            )
            .expect("Failed to register plugin_errors_total"),

            build_info: register_gauge_vec!(
                "descheduler_build_info",
                "Build information for the running descheduler",
                &["version"]
            )
            .expect("Failed to register build_info"),
        }
    }
}

/// Descheduler metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct DeschedulerMetrics {
    _private: (),
}

impl Default for DeschedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeschedulerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DeschedulerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DeschedulerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record the result of one eviction attempt
    pub fn record_eviction(&self, result: &str, candidate: &Candidate) {
        self.inner()
            .pods_evicted
            .with_label_values(&[
                result,
                &candidate.plugin,
                &candidate.profile,
                &candidate.pod.namespace,
                &candidate.node,
            ])
            .inc();
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
    }

    /// Publish the per-outcome candidate counts of the last cycle
    pub fn set_cycle_candidates(&self, evicted: usize, skipped: usize, failed: usize) {
        let gauges = &self.inner().cycle_candidates;
        gauges.with_label_values(&["evicted"]).set(evicted as i64);
        gauges.with_label_values(&["skipped"]).set(skipped as i64);
        gauges.with_label_values(&["failed"]).set(failed as i64);
    }

    pub fn inc_profile_errors(&self, profile: &str) {
        self.inner().profile_errors.with_label_values(&[profile]).inc();
    }

    pub fn inc_plugin_errors(&self, plugin: &str, stage: &str) {
        self.inner()
            .plugin_errors
            .with_label_values(&[plugin, stage])
            .inc();
    }

    pub fn set_build_info(&self, version: &str) {
        self.inner().build_info.reset();
        self.inner().build_info.with_label_values(&[version]).set(1.0);
    }
}

/// Structured logger for descheduler events
///
/// Provides consistent JSON-formatted logging for evictions, cycles
/// and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a successful (or simulated) eviction
    pub fn log_eviction(&self, candidate: &Candidate, dry_run: bool) {
        info!(
            event = "pod_evicted",
            instance = %self.instance,
            pod = %candidate.pod.key(),
            node = %candidate.node,
            profile = %candidate.profile,
            strategy = %candidate.plugin,
            dry_run = dry_run,
            "Evicted pod"
        );
    }

    /// Log a skipped candidate
    pub fn log_eviction_skipped(&self, candidate: &Candidate, reason: SkipReason) {
        info!(
            event = "pod_eviction_skipped",
            instance = %self.instance,
            pod = %candidate.pod.key(),
            node = %candidate.node,
            profile = %candidate.profile,
            strategy = %candidate.plugin,
            reason = %reason,
            "Skipped eviction"
        );
    }

    /// Log an eviction that failed after retries
    pub fn log_eviction_failed(&self, candidate: &Candidate, error: &str) {
        warn!(
            event = "pod_eviction_failed",
            instance = %self.instance,
            pod = %candidate.pod.key(),
            node = %candidate.node,
            profile = %candidate.profile,
            strategy = %candidate.plugin,
            error = %error,
            "Eviction failed"
        );
    }

    /// Log a profile that could not be built
    pub fn log_profile_error(&self, profile: &str, error: &str) {
        warn!(
            event = "profile_config_error",
            instance = %self.instance,
            profile = %profile,
            error = %error,
            "Profile skipped due to configuration error"
        );
    }

    /// Log the end of a cycle
    pub fn log_cycle_summary(&self, summary: &RunSummary) {
        info!(
            event = "cycle_completed",
            instance = %self.instance,
            evicted = summary.evicted,
            skipped = summary.skipped,
            failed = summary.failed,
            nodes = summary.nodes_considered,
            deadline_exceeded = summary.deadline_exceeded,
            profile_errors = summary.profile_errors.len(),
            "Descheduling cycle completed"
        );
    }

    /// Log descheduler startup
    pub fn log_startup(&self, version: &str, profiles: usize, dry_run: bool) {
        info!(
            event = "descheduler_started",
            instance = %self.instance,
            version = %version,
            profiles = profiles,
            dry_run = dry_run,
            "Descheduler started"
        );
    }

    /// Log descheduler shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "descheduler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Descheduler shutting down"
        );
    }
}
