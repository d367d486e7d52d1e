//! Eviction budget engine
//!
//! [`EvictionBudget`] is the only component that mutates cluster state. It
//! turns candidates into eviction attempts while enforcing the per-node,
//! per-namespace and total ceilings of the policy, runs the pre-eviction
//! filter chain, and retries transient failures of the [`Evictor`].

mod counters;
mod retry;

pub use counters::{EvictionCounters, EvictionLimits, Reservation};
pub use retry::{retry, RetryPolicy};

use crate::framework::{Candidate, FilterChain, Verdict};
use crate::models::Pod;
use crate::observability::{DeschedulerMetrics, StructuredLogger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Why a candidate was not evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    MinLifetimeUnmet,
    FilterRejected,
    PreEvictionFilterRejected,
    NodeCeilingReached,
    NamespaceCeilingReached,
    TotalCeilingReached,
    AlreadyEvicted,
    Conflict,
    NotFound,
    DisruptionBudgetViolation,
    DeadlineExceeded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MinLifetimeUnmet => "min-lifetime-unmet",
            SkipReason::FilterRejected => "filter-rejected",
            SkipReason::PreEvictionFilterRejected => "pre-eviction-filter-rejected",
            SkipReason::NodeCeilingReached => "node-ceiling-reached",
            SkipReason::NamespaceCeilingReached => "namespace-ceiling-reached",
            SkipReason::TotalCeilingReached => "total-ceiling-reached",
            SkipReason::AlreadyEvicted => "already-evicted",
            SkipReason::Conflict => "conflict",
            SkipReason::NotFound => "not-found",
            SkipReason::DisruptionBudgetViolation => "disruption-budget-violation",
            SkipReason::DeadlineExceeded => "deadline-exceeded",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an admitted candidate could not be evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// The evictor kept returning transient errors
    RetriesExhausted,
    /// The node task running the attempt panicked
    TaskPanicked,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RetriesExhausted => "retries-exhausted",
            FailureReason::TaskPanicked => "task-panicked",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one eviction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionOutcome {
    Evicted,
    Skipped(SkipReason),
    Failed(FailureReason, String),
}

/// Errors returned by the removal primitive
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvictError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("disruption budget violation: {0}")]
    DisruptionBudget(String),

    #[error("{0}")]
    Other(String),
}

impl EvictError {
    fn is_retryable(&self) -> bool {
        matches!(self, EvictError::Other(_))
    }
}

/// Removal primitive
#[async_trait]
pub trait Evictor: Send + Sync {
    /// Request graceful removal of `pod`; with `dry_run` the request is
    /// validated but nothing is removed
    async fn evict(&self, pod: &Pod, dry_run: bool) -> Result<(), EvictError>;
}

/// One call observed by [`RecordingEvictor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCall {
    pub pod: String,
    pub node: Option<String>,
    pub dry_run: bool,
}

/// In-memory evictor that records calls and replays scripted failures
#[derive(Debug, Default)]
pub struct RecordingEvictor {
    calls: Mutex<Vec<EvictionCall>>,
    scripted: Mutex<HashMap<String, VecDeque<EvictError>>>,
    latency: Option<Duration>,
}

impl RecordingEvictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue an error for the next call on `pod_key` (`namespace/name`)
    pub fn fail_with(&self, pod_key: &str, error: EvictError) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(pod_key.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self) -> Vec<EvictionCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keys of pods whose eviction call succeeded
    pub fn evicted(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.pod).collect()
    }
}

#[async_trait]
impl Evictor for RecordingEvictor {
    async fn evict(&self, pod: &Pod, dry_run: bool) -> Result<(), EvictError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let key = pod.key();
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(EvictionCall {
                pod: key,
                node: pod.node_name.clone(),
                dry_run,
            });
        Ok(())
    }
}

/// Whether evictions are performed or only simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionMode {
    DryRun,
    #[default]
    Live,
}

impl EvictionMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            EvictionMode::DryRun
        } else {
            EvictionMode::Live
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, EvictionMode::DryRun)
    }
}

/// Reservation released on drop unless committed, so an attempt that
/// unwinds never keeps its slot
struct HeldSlot<'a> {
    budget: &'a EvictionBudget,
    reservation: Option<Reservation>,
}

impl HeldSlot<'_> {
    fn commit(mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.budget.lock().commit(reservation);
        }
    }
}

impl Drop for HeldSlot<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.budget.lock().release(reservation);
        }
    }
}

/// Rate-limited gateway to the [`Evictor`]
pub struct EvictionBudget {
    limits: EvictionLimits,
    evictor: Arc<dyn Evictor>,
    mode: EvictionMode,
    retry: RetryPolicy,
    counters: Mutex<EvictionCounters>,
    metrics: DeschedulerMetrics,
    logger: StructuredLogger,
}

impl EvictionBudget {
    pub fn new(limits: EvictionLimits, evictor: Arc<dyn Evictor>, mode: EvictionMode) -> Self {
        Self {
            limits,
            evictor,
            mode,
            retry: RetryPolicy::default(),
            counters: Mutex::new(EvictionCounters::default()),
            metrics: DeschedulerMetrics::new(),
            logger: StructuredLogger::new("descheduler"),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn limits(&self) -> &EvictionLimits {
        &self.limits
    }

    pub fn mode(&self) -> EvictionMode {
        self.mode
    }

    /// Zero all counters; called once at the start of every cycle
    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn total_evicted(&self) -> u32 {
        self.lock().total()
    }

    pub fn evicted_on_node(&self, node: &str) -> u32 {
        self.lock().on_node(node)
    }

    pub fn evicted_in_namespace(&self, namespace: &str) -> u32 {
        self.lock().in_namespace(namespace)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EvictionCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt to evict one admitted candidate
    pub async fn try_evict(
        &self,
        candidate: &Candidate,
        pre_eviction: &FilterChain,
    ) -> EvictionOutcome {
        let pod = &candidate.pod;

        let reserved = self
            .lock()
            .reserve(&self.limits, &candidate.node, &pod.namespace, &pod.uid);
        let slot = match reserved {
            Ok(reservation) => HeldSlot {
                budget: self,
                reservation: Some(reservation),
            },
            Err(reason) => return self.skipped(candidate, reason),
        };

        if let Verdict::Reject { plugin, reason } = pre_eviction.evaluate(pod) {
            debug!(pod = %pod.key(), plugin = %plugin, reason = %reason, "Pre-eviction filter rejected pod");
            drop(slot);
            return self.skipped(candidate, SkipReason::PreEvictionFilterRejected);
        }

        let result = if self.mode.is_dry_run() {
            Ok(())
        } else {
            let evictor = self.evictor.clone();
            retry("evict", &self.retry, EvictError::is_retryable, || {
                let evictor = evictor.clone();
                async move { evictor.evict(pod, false).await }
            })
            .await
        };

        match result {
            Ok(()) => {
                slot.commit();
                let result = if self.mode.is_dry_run() { "dry-run" } else { "success" };
                self.metrics.record_eviction(result, candidate);
                self.logger.log_eviction(candidate, self.mode.is_dry_run());
                EvictionOutcome::Evicted
            }
            Err(error) => {
                drop(slot);
                match error {
                    EvictError::Conflict(_) => self.skipped(candidate, SkipReason::Conflict),
                    EvictError::NotFound(_) => self.skipped(candidate, SkipReason::NotFound),
                    EvictError::DisruptionBudget(_) => {
                        self.skipped(candidate, SkipReason::DisruptionBudgetViolation)
                    }
                    EvictError::Other(message) => {
                        self.metrics.record_eviction("error", candidate);
                        self.logger.log_eviction_failed(candidate, &message);
                        EvictionOutcome::Failed(FailureReason::RetriesExhausted, message)
                    }
                }
            }
        }
    }

    fn skipped(&self, candidate: &Candidate, reason: SkipReason) -> EvictionOutcome {
        self.logger.log_eviction_skipped(candidate, reason);
        EvictionOutcome::Skipped(reason)
    }
}
