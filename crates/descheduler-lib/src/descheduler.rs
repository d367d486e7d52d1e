//! Descheduling loop
//!
//! A cycle takes a fresh snapshot, builds the utilization index, resets the
//! eviction counters and runs every profile of the policy in order under one
//! cancellation context. [`Descheduler::run`] repeats cycles on an interval
//! until shutdown and publishes each summary on a watch channel.

use crate::api::{Policy, PolicyError};
use crate::cluster::{SnapshotError, SnapshotSource};
use crate::evictions::{EvictionBudget, EvictionLimits, EvictionMode, Evictor, RetryPolicy};
use crate::framework::{Cancellation, ExecutionOptions, Handle, ProfileExecutor, Registry};
use crate::health::{components, HealthRegistry};
use crate::models::LabelSelector;
use crate::observability::{DeschedulerMetrics, StructuredLogger};
use crate::plugins;
use crate::summary::RunSummary;
use crate::utilization::{UsageOrigin, UtilizationIndex, UtilizationSource};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info};

/// Runtime knobs that are not part of the policy document
#[derive(Debug, Clone)]
pub struct DeschedulerOptions {
    pub dry_run: bool,
    /// Node batches evicted concurrently
    pub max_parallel_nodes: usize,
    /// Deadline for a single cycle
    pub cycle_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for DeschedulerOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_parallel_nodes: 1,
            cycle_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Descheduler {
    policy: Policy,
    node_selector: Option<LabelSelector>,
    registry: Registry,
    snapshots: Arc<dyn SnapshotSource>,
    utilization: Option<Arc<dyn UtilizationSource>>,
    budget: Arc<EvictionBudget>,
    options: DeschedulerOptions,
    health: HealthRegistry,
    metrics: DeschedulerMetrics,
    logger: StructuredLogger,
    summaries: watch::Sender<Option<RunSummary>>,
}

impl Descheduler {
    pub fn new(
        policy: Policy,
        snapshots: Arc<dyn SnapshotSource>,
        evictor: Arc<dyn Evictor>,
        options: DeschedulerOptions,
    ) -> Result<Self, PolicyError> {
        policy.validate()?;
        let node_selector = policy.node_selector()?;
        let logger = StructuredLogger::new("descheduler");
        let budget = EvictionBudget::new(
            EvictionLimits::from_policy(&policy),
            evictor,
            EvictionMode::from_dry_run(options.dry_run),
        )
        .with_retry(options.retry.clone())
        .with_logger(logger.clone());
        let (summaries, _) = watch::channel(None);

        Ok(Self {
            policy,
            node_selector,
            registry: plugins::registry(),
            snapshots,
            utilization: None,
            budget: Arc::new(budget),
            options,
            health: HealthRegistry::new(),
            metrics: DeschedulerMetrics::new(),
            logger,
            summaries,
        })
    }

    /// Replace the built-in plugin registry
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Use actual usage figures instead of requests where available
    pub fn with_utilization(mut self, source: Arc<dyn UtilizationSource>) -> Self {
        self.utilization = Some(source);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Receiver for the summary of the latest completed cycle
    pub fn subscribe(&self) -> watch::Receiver<Option<RunSummary>> {
        self.summaries.subscribe()
    }

    /// Run every profile once
    pub async fn run_once(&self, cancel: &Cancellation) -> Result<RunSummary, SnapshotError> {
        let started = Instant::now();
        let cancel = match self.options.cycle_timeout {
            Some(timeout) => cancel.clone().with_timeout(timeout),
            None => cancel.clone(),
        };

        let fetched = cancel
            .run_until(self.snapshots.snapshot(self.node_selector.as_ref()))
            .await;
        let snapshot = match fetched {
            Some(Ok(snapshot)) => {
                self.health.set_healthy(components::SNAPSHOT_SOURCE).await;
                snapshot
            }
            Some(Err(err)) => {
                self.health
                    .set_unhealthy(components::SNAPSHOT_SOURCE, err.to_string())
                    .await;
                return Err(err);
            }
            None => {
                self.health
                    .set_degraded(
                        components::SNAPSHOT_SOURCE,
                        "cluster state not received before the cycle was cancelled",
                    )
                    .await;
                let mut summary = RunSummary::new(Utc::now(), self.options.dry_run);
                summary.deadline_exceeded = true;
                return Ok(self.finish(summary, started));
            }
        };

        let usage = UtilizationIndex::build(&snapshot, self.utilization.as_ref(), &cancel).await;
        if self.utilization.is_some() {
            self.record_utilization_health(&usage).await;
        }
        let now = snapshot.observed_at();
        let handle = Handle::new(Arc::new(snapshot), Arc::new(usage), now);

        self.budget.reset();
        let options = ExecutionOptions {
            max_parallel_nodes: self.options.max_parallel_nodes,
            cancel,
        };

        let mut summary = RunSummary::new(Utc::now(), self.options.dry_run);
        summary.nodes_considered = handle.snapshot().nodes().len();

        for profile in &self.policy.profiles {
            if options.cancel.is_cancelled() {
                info!(profile = %profile.name, "Cycle cancelled, profile not run");
                continue;
            }
            match ProfileExecutor::build(profile, &self.registry, &handle) {
                Ok(executor) => {
                    let report = executor.run(&handle, self.budget.clone(), &options).await;
                    summary.record_report(&report);
                }
                Err(err) => {
                    self.logger.log_profile_error(&profile.name, &err.to_string());
                    self.metrics.inc_profile_errors(&profile.name);
                    summary.record_profile_error(&profile.name, &err);
                }
            }
        }
        if options.cancel.is_cancelled() {
            summary.deadline_exceeded = true;
        }

        if summary.failed > 0 {
            self.health
                .set_degraded(
                    components::EVICTOR,
                    format!("{} evictions failed in the last cycle", summary.failed),
                )
                .await;
        } else {
            self.health.set_healthy(components::EVICTOR).await;
        }

        Ok(self.finish(summary, started))
    }

    /// Stamp, record and publish a completed cycle
    fn finish(&self, mut summary: RunSummary, started: Instant) -> RunSummary {
        let elapsed = started.elapsed();
        summary.duration_ms = elapsed.as_millis() as u64;
        self.metrics.observe_cycle_duration(elapsed.as_secs_f64());
        self.metrics
            .set_cycle_candidates(summary.evicted, summary.skipped, summary.failed);
        self.logger.log_cycle_summary(&summary);
        self.summaries.send_replace(Some(summary.clone()));
        summary
    }

    async fn record_utilization_health(&self, usage: &UtilizationIndex) {
        let total = usage.len();
        let estimated = usage.count(UsageOrigin::Requests);
        if estimated == 0 {
            self.health.set_healthy(components::UTILIZATION_SOURCE).await;
        } else if estimated == total {
            self.health
                .set_unhealthy(
                    components::UTILIZATION_SOURCE,
                    format!("no usage reported for any of {} nodes", total),
                )
                .await;
        } else {
            self.health
                .set_degraded(
                    components::UTILIZATION_SOURCE,
                    format!("{} of {} nodes estimated from requests", estimated, total),
                )
                .await;
        }
    }

    async fn cycle(&self, cancel: &Cancellation) {
        let result = self.run_once(cancel).await;
        if let Err(err) = &result {
            error!(error = %err, "Descheduling cycle failed");
        }
        self.health
            .record_cycle(result.map(|_| ()).map_err(|e| e.to_string()))
            .await;
    }

    /// Run cycles every `every` until shutdown; zero runs a single cycle.
    /// A shutdown during a cycle cancels new eviction attempts and waits for
    /// in-flight ones.
    pub async fn run(&self, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        self.health.register(components::SNAPSHOT_SOURCE).await;
        self.health.register(components::EVICTOR).await;
        if self.utilization.is_some() {
            self.health.register(components::UTILIZATION_SOURCE).await;
        }
        self.health.register(components::LOOP).await;
        self.health.set_ready(true).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let cancel = Cancellation::none().with_signal(stop_rx);
        let single_shot = every.is_zero();

        let mut ticker = interval(if single_shot { Duration::from_secs(1) } else { every });
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = every.as_secs(),
            profiles = self.policy.profiles.len(),
            dry_run = self.options.dry_run,
            "Starting descheduling loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            let cycle = self.cycle(&cancel);
            tokio::pin!(cycle);
            let stopping = tokio::select! {
                _ = &mut cycle => false,
                _ = shutdown.recv() => {
                    stop_tx.send_replace(true);
                    cycle.await;
                    true
                }
            };

            if stopping || single_shot {
                break;
            }
        }

        self.health.set_ready(false).await;
        info!("Descheduling loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ExtensionPoint, Profile};
    use crate::cluster::StaticSnapshotSource;
    use crate::evictions::{RecordingEvictor, SkipReason};
    use crate::health::ComponentStatus;
    use crate::models::{Node, Pod, PodPhase, ResourceList};
    use crate::utilization::StaticUtilization;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn node(name: &str) -> Node {
        Node::new(name, ResourceList::new(4000, 8 << 30, 110)).with_label("pool", "workers")
    }

    fn failed(name: &str, node: &str) -> Pod {
        Pod::new("default", name)
            .on_node(node)
            .owned_by("Job", "batch")
            .with_phase(PodPhase::Failed)
            .started_at(Utc::now() - ChronoDuration::hours(1))
    }

    fn policy() -> Policy {
        Policy {
            max_no_of_pods_to_evict_total: Some(2),
            profiles: vec![
                Profile::new("failed")
                    .with_plugin(
                        "DefaultEvictor",
                        json!({}),
                        &[ExtensionPoint::Filter, ExtensionPoint::PreEvictionFilter],
                    )
                    .with_plugin("RemoveFailedPods", json!({}), &[ExtensionPoint::Deschedule]),
                Profile::new("broken").with_plugin(
                    "PodLifeTime",
                    json!({}),
                    &[ExtensionPoint::Deschedule],
                ),
            ],
            ..Default::default()
        }
    }

    fn source() -> Arc<StaticSnapshotSource> {
        Arc::new(StaticSnapshotSource::new(
            vec![node("n1"), node("n2")],
            vec![failed("a", "n1"), failed("b", "n1"), failed("c", "n2")],
        ))
    }

    #[tokio::test]
    async fn test_run_once() {
        let evictor = Arc::new(RecordingEvictor::new());
        let descheduler =
            Descheduler::new(policy(), source(), evictor.clone(), DeschedulerOptions::default())
                .unwrap();
        let mut summaries = descheduler.subscribe();

        let summary = descheduler.run_once(&Cancellation::none()).await.unwrap();

        assert_eq!(summary.evicted, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.by_reason[&SkipReason::TotalCeilingReached], 1);
        assert_eq!(summary.nodes_considered, 2);
        assert_eq!(summary.profile_errors.len(), 1);
        assert_eq!(summary.profile_errors[0].profile, "broken");
        assert_eq!(evictor.calls().len(), 2);

        assert!(summaries.has_changed().unwrap());
        assert_eq!(summaries.borrow_and_update().as_ref(), Some(&summary));
    }

    #[tokio::test]
    async fn test_counters_reset_between_cycles() {
        let evictor = Arc::new(RecordingEvictor::new());
        let descheduler =
            Descheduler::new(policy(), source(), evictor.clone(), DeschedulerOptions::default())
                .unwrap();

        let first = descheduler.run_once(&Cancellation::none()).await.unwrap();
        let second = descheduler.run_once(&Cancellation::none()).await.unwrap();

        assert_eq!(first.evicted, 2);
        assert_eq!(second.evicted, 2);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_call_evictor() {
        let evictor = Arc::new(RecordingEvictor::new());
        let options = DeschedulerOptions {
            dry_run: true,
            ..Default::default()
        };
        let descheduler = Descheduler::new(policy(), source(), evictor.clone(), options).unwrap();

        let summary = descheduler.run_once(&Cancellation::none()).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.evicted, 2);
        assert!(evictor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_node_selector_limits_nodes() {
        let mut policy = policy();
        policy.node_selector = Some("pool=workers".to_string());
        let source = Arc::new(StaticSnapshotSource::new(
            vec![node("n1"), Node::new("infra", ResourceList::new(4000, 8 << 30, 110))],
            vec![failed("a", "n1"), failed("z", "infra")],
        ));
        let descheduler = Descheduler::new(
            policy,
            source,
            Arc::new(RecordingEvictor::new()),
            DeschedulerOptions::default(),
        )
        .unwrap();

        let summary = descheduler.run_once(&Cancellation::none()).await.unwrap();
        assert_eq!(summary.nodes_considered, 1);
        assert_eq!(summary.by_node.keys().collect::<Vec<_>>(), vec!["n1"]);
    }

    struct Unreachable;

    #[async_trait]
    impl SnapshotSource for Unreachable {
        async fn snapshot(
            &self,
            _node_selector: Option<&LabelSelector>,
        ) -> Result<crate::cluster::ClusterSnapshot, SnapshotError> {
            Err(SnapshotError::List {
                resource: "nodes",
                message: "connection refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_snapshot_failure_marks_source_unhealthy() {
        let health = HealthRegistry::new();
        let descheduler = Descheduler::new(
            policy(),
            Arc::new(Unreachable),
            Arc::new(RecordingEvictor::new()),
            DeschedulerOptions::default(),
        )
        .unwrap()
        .with_health(health.clone());

        assert!(descheduler.run_once(&Cancellation::none()).await.is_err());
        let status = health.health().await.components[components::SNAPSHOT_SOURCE].status;
        assert_eq!(status, ComponentStatus::Unhealthy);
    }

    struct Stalled;

    #[async_trait]
    impl SnapshotSource for Stalled {
        async fn snapshot(
            &self,
            _node_selector: Option<&LabelSelector>,
        ) -> Result<crate::cluster::ClusterSnapshot, SnapshotError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(SnapshotError::List {
                resource: "pods",
                message: "stalled".to_string(),
            })
        }
    }

    struct SlowMetrics;

    #[async_trait]
    impl UtilizationSource for SlowMetrics {
        fn name(&self) -> &str {
            "slow"
        }

        async fn node_usage(&self, _node: &str) -> Option<crate::utilization::ResourceUsage> {
            tokio::time::sleep(Duration::from_millis(400)).await;
            None
        }
    }

    fn with_timeout(timeout: Duration) -> DeschedulerOptions {
        DeschedulerOptions {
            cycle_timeout: Some(timeout),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_timeout_bounds_snapshot_fetch() {
        let evictor = Arc::new(RecordingEvictor::new());
        let health = HealthRegistry::new();
        let descheduler = Descheduler::new(
            policy(),
            Arc::new(Stalled),
            evictor.clone(),
            with_timeout(Duration::from_millis(100)),
        )
        .unwrap()
        .with_health(health.clone());
        let started = Instant::now();

        let summary = descheduler.run_once(&Cancellation::none()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.deadline_exceeded);
        assert_eq!(summary.candidates(), 0);
        assert!(evictor.calls().is_empty());
        let status = health.health().await.components[components::SNAPSHOT_SOURCE].status;
        assert_eq!(status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_cycle_timeout_bounds_usage_queries() {
        let nodes: Vec<Node> = (0..5).map(|i| node(&format!("n{i}"))).collect();
        let pods = (0..5)
            .map(|i| failed(&format!("p{i}"), &format!("n{i}")))
            .collect();
        let evictor = Arc::new(RecordingEvictor::new());
        let descheduler = Descheduler::new(
            policy(),
            Arc::new(StaticSnapshotSource::new(nodes, pods)),
            evictor.clone(),
            with_timeout(Duration::from_millis(100)),
        )
        .unwrap()
        .with_utilization(Arc::new(SlowMetrics));
        let started = Instant::now();

        let summary = descheduler.run_once(&Cancellation::none()).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(390));
        assert!(summary.deadline_exceeded);
        assert_eq!(summary.evicted, 0);
        assert!(evictor.calls().is_empty());
    }

    async fn utilization_status(utilization: StaticUtilization) -> (ComponentStatus, Option<String>) {
        let health = HealthRegistry::new();
        let descheduler = Descheduler::new(
            policy(),
            source(),
            Arc::new(RecordingEvictor::new()),
            DeschedulerOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap()
        .with_health(health.clone())
        .with_utilization(Arc::new(utilization));

        descheduler.run_once(&Cancellation::none()).await.unwrap();
        let component = health.health().await.components[components::UTILIZATION_SOURCE].clone();
        (component.status, component.message)
    }

    #[tokio::test]
    async fn test_utilization_health_follows_fallbacks() {
        let usage = ResourceList::new(1000, 1 << 30, 0);

        let (status, _) = utilization_status(
            StaticUtilization::new()
                .with_node("n1", usage)
                .with_node("n2", usage),
        )
        .await;
        assert_eq!(status, ComponentStatus::Healthy);

        let (status, message) =
            utilization_status(StaticUtilization::new().with_node("n1", usage)).await;
        assert_eq!(status, ComponentStatus::Degraded);
        assert_eq!(message.as_deref(), Some("1 of 2 nodes estimated from requests"));

        let (status, _) = utilization_status(StaticUtilization::new()).await;
        assert_eq!(status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_single_shot_run() {
        let evictor = Arc::new(RecordingEvictor::new());
        let descheduler =
            Descheduler::new(policy(), source(), evictor.clone(), DeschedulerOptions::default())
                .unwrap();
        let summaries = descheduler.subscribe();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        descheduler.run(Duration::ZERO, shutdown_rx).await;

        assert_eq!(summaries.borrow().as_ref().map(|s| s.evicted), Some(2));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let descheduler = Arc::new(
            Descheduler::new(
                policy(),
                source(),
                Arc::new(RecordingEvictor::new()),
                DeschedulerOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let running = {
            let descheduler = descheduler.clone();
            tokio::spawn(async move { descheduler.run(Duration::from_secs(3600), shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(descheduler.subscribe().borrow().is_some());
    }
}
