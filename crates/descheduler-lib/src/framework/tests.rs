use super::*;
use crate::api::{ExtensionPoint, Profile};
use crate::cluster::ClusterSnapshot;
use crate::error::{ConfigError, PluginError};
use crate::evictions::{
    EvictError, EvictionBudget, EvictionLimits, EvictionMode, EvictionOutcome, FailureReason,
    RecordingEvictor, RetryPolicy, SkipReason,
};
use crate::models::{DisruptionBudget, LabelSelector, Node, Pod, PodPhase, ResourceList};
use crate::plugins;
use crate::summary::RunSummary;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

fn node(name: &str) -> Node {
    Node::new(name, ResourceList::new(4000, 8 << 30, 110))
}

fn failed_pod(name: &str, node: &str, age_secs: i64) -> Pod {
    Pod::new("default", name)
        .on_node(node)
        .owned_by("ReplicaSet", "app")
        .with_phase(PodPhase::Failed)
        .started_at(Utc::now() - Duration::seconds(age_secs))
}

fn failed_pods_profile(min_lifetime: u64, evictor_args: serde_json::Value) -> Profile {
    Profile::new("default")
        .with_plugin(
            "DefaultEvictor",
            evictor_args,
            &[ExtensionPoint::Filter, ExtensionPoint::PreEvictionFilter],
        )
        .with_plugin(
            "RemoveFailedPods",
            json!({"minPodLifetimeSeconds": min_lifetime}),
            &[ExtensionPoint::Deschedule],
        )
}

fn budget(limits: EvictionLimits, evictor: Arc<RecordingEvictor>, mode: EvictionMode) -> Arc<EvictionBudget> {
    Arc::new(EvictionBudget::new(limits, evictor, mode).with_retry(RetryPolicy::immediate(1)))
}

async fn run(
    profile: &Profile,
    snapshot: ClusterSnapshot,
    limits: EvictionLimits,
    mode: EvictionMode,
) -> (ProfileReport, Arc<RecordingEvictor>) {
    let handle = Handle::from_snapshot(snapshot);
    let executor = ProfileExecutor::build(profile, &plugins::registry(), &handle).unwrap();
    let evictor = Arc::new(RecordingEvictor::new());
    let report = executor
        .run(
            &handle,
            budget(limits, evictor.clone(), mode),
            &ExecutionOptions::default(),
        )
        .await;
    (report, evictor)
}

fn outcomes(report: &ProfileReport) -> Vec<(String, EvictionOutcome)> {
    report
        .results
        .iter()
        .map(|r| (r.candidate.pod.name.clone(), r.outcome.clone()))
        .collect()
}

#[tokio::test]
async fn test_failed_pod_is_evicted() {
    let snapshot = ClusterSnapshot::new(
        vec![node("n1")],
        vec![failed_pod("p", "n1", 60)],
        Vec::new(),
        Utc::now(),
    );

    let (report, evictor) = run(
        &failed_pods_profile(0, json!({})),
        snapshot,
        EvictionLimits::unlimited(),
        EvictionMode::Live,
    )
    .await;

    assert_eq!(outcomes(&report), vec![("p".to_string(), EvictionOutcome::Evicted)]);
    assert_eq!(report.nodes_considered, 1);
    assert_eq!(evictor.evicted(), vec!["default/p".to_string()]);
    assert!(!evictor.calls()[0].dry_run);
}

#[tokio::test]
async fn test_young_failed_pod_is_held() {
    let snapshot = ClusterSnapshot::new(
        vec![node("n1")],
        vec![failed_pod("p", "n1", 10)],
        Vec::new(),
        Utc::now(),
    );

    let (report, evictor) = run(
        &failed_pods_profile(3600, json!({})),
        snapshot,
        EvictionLimits::unlimited(),
        EvictionMode::Live,
    )
    .await;

    assert_eq!(
        outcomes(&report),
        vec![(
            "p".to_string(),
            EvictionOutcome::Skipped(SkipReason::MinLifetimeUnmet)
        )]
    );
    assert!(evictor.calls().is_empty());
}

#[tokio::test]
async fn test_node_ceiling_applies_across_candidates() {
    let snapshot = ClusterSnapshot::new(
        vec![node("n1")],
        vec![failed_pod("a", "n1", 60), failed_pod("b", "n1", 60)],
        Vec::new(),
        Utc::now(),
    );
    let limits = EvictionLimits {
        per_node: Some(1),
        ..Default::default()
    };

    let (report, evictor) = run(
        &failed_pods_profile(0, json!({})),
        snapshot,
        limits,
        EvictionMode::Live,
    )
    .await;

    assert_eq!(
        outcomes(&report),
        vec![
            ("a".to_string(), EvictionOutcome::Evicted),
            (
                "b".to_string(),
                EvictionOutcome::Skipped(SkipReason::NodeCeilingReached)
            ),
        ]
    );
    assert_eq!(evictor.calls().len(), 1);
}

#[tokio::test]
async fn test_pods_without_disruption_budget_are_filtered() {
    let snapshot = ClusterSnapshot::new(
        vec![node("n1")],
        vec![
            failed_pod("unguarded", "n1", 60),
            failed_pod("guarded", "n1", 60).with_label("app", "web"),
        ],
        vec![DisruptionBudget {
            namespace: "default".to_string(),
            name: "web".to_string(),
            selector: LabelSelector::parse("app=web").unwrap(),
        }],
        Utc::now(),
    );

    let (report, _) = run(
        &failed_pods_profile(0, json!({"ignorePodsWithoutPDB": true})),
        snapshot,
        EvictionLimits::unlimited(),
        EvictionMode::Live,
    )
    .await;

    assert_eq!(
        outcomes(&report),
        vec![
            ("guarded".to_string(), EvictionOutcome::Evicted),
            (
                "unguarded".to_string(),
                EvictionOutcome::Skipped(SkipReason::FilterRejected)
            ),
        ]
    );
}

#[tokio::test]
async fn test_dry_run_matches_live_outcomes() {
    let snapshot = || {
        ClusterSnapshot::new(
            vec![node("n1"), node("n2")],
            vec![
                failed_pod("a", "n1", 60),
                failed_pod("b", "n1", 60),
                failed_pod("c", "n2", 10),
                failed_pod("d", "n2", 7200),
            ],
            Vec::new(),
            Utc::now(),
        )
    };
    let limits = EvictionLimits {
        per_node: Some(1),
        ..Default::default()
    };
    let profile = failed_pods_profile(30, json!({}));

    let (live, _) = run(&profile, snapshot(), limits, EvictionMode::Live).await;
    let (dry, evictor) = run(&profile, snapshot(), limits, EvictionMode::DryRun).await;

    assert_eq!(outcomes(&live), outcomes(&dry));
    assert!(evictor.calls().is_empty());
}

#[tokio::test]
async fn test_repeated_runs_on_frozen_snapshot_are_identical() {
    let snapshot = ClusterSnapshot::new(
        vec![node("n1"), node("n2")],
        vec![
            failed_pod("a", "n1", 60),
            failed_pod("b", "n2", 60),
            failed_pod("c", "n2", 60),
        ],
        Vec::new(),
        Utc::now(),
    );
    let handle = Handle::from_snapshot(snapshot);
    let profile = failed_pods_profile(0, json!({}));
    let executor = ProfileExecutor::build(&profile, &plugins::registry(), &handle).unwrap();
    let budget = budget(
        EvictionLimits {
            per_namespace: Some(2),
            ..Default::default()
        },
        Arc::new(RecordingEvictor::new()),
        EvictionMode::DryRun,
    );

    let first = executor
        .run(&handle, budget.clone(), &ExecutionOptions::default())
        .await;
    budget.reset();
    let second = executor
        .run(&handle, budget.clone(), &ExecutionOptions::default())
        .await;

    assert_eq!(outcomes(&first), outcomes(&second));
    assert_eq!(
        outcomes(&first).last().unwrap().1,
        EvictionOutcome::Skipped(SkipReason::NamespaceCeilingReached)
    );
}

#[tokio::test]
async fn test_parallel_batches_keep_node_order() {
    let nodes: Vec<Node> = (1..=6).map(|i| node(&format!("n{i}"))).collect();
    let pods: Vec<Pod> = (1..=6)
        .map(|i| failed_pod(&format!("p{i}"), &format!("n{i}"), 60))
        .collect();
    let handle = Handle::from_snapshot(ClusterSnapshot::new(nodes, pods, Vec::new(), Utc::now()));
    let executor = ProfileExecutor::build(
        &failed_pods_profile(0, json!({})),
        &plugins::registry(),
        &handle,
    )
    .unwrap();
    let evictor = Arc::new(RecordingEvictor::new().with_latency(std::time::Duration::from_millis(5)));
    let options = ExecutionOptions {
        max_parallel_nodes: 3,
        ..Default::default()
    };

    let report = executor
        .run(
            &handle,
            budget(EvictionLimits::unlimited(), evictor.clone(), EvictionMode::Live),
            &options,
        )
        .await;

    let names: Vec<String> = outcomes(&report).into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["p1", "p2", "p3", "p4", "p5", "p6"]);
    assert_eq!(evictor.calls().len(), 6);
}

#[tokio::test]
async fn test_expired_deadline_skips_everything() {
    let snapshot = ClusterSnapshot::new(
        vec![node("n1")],
        vec![failed_pod("a", "n1", 60), failed_pod("b", "n1", 10)],
        Vec::new(),
        Utc::now(),
    );
    let handle = Handle::from_snapshot(snapshot);
    let executor = ProfileExecutor::build(
        &failed_pods_profile(30, json!({})),
        &plugins::registry(),
        &handle,
    )
    .unwrap();
    let evictor = Arc::new(RecordingEvictor::new());
    let options = ExecutionOptions {
        max_parallel_nodes: 1,
        cancel: Cancellation::none().with_timeout(std::time::Duration::ZERO),
    };

    let report = executor
        .run(
            &handle,
            budget(EvictionLimits::unlimited(), evictor.clone(), EvictionMode::Live),
            &options,
        )
        .await;

    assert!(report
        .results
        .iter()
        .all(|r| r.outcome == EvictionOutcome::Skipped(SkipReason::DeadlineExceeded)));
    assert_eq!(report.results.len(), 2);
    assert!(evictor.calls().is_empty());
}

#[test]
fn test_capability_mismatch() {
    let profile = Profile::new("p").with_plugin(
        "RemoveFailedPods",
        json!({}),
        &[ExtensionPoint::Filter],
    );
    let err = ProfileExecutor::build(&profile, &plugins::registry(), &Handle::empty())
        .err()
        .unwrap();
    assert_eq!(
        err,
        ConfigError::CapabilityMismatch {
            profile: "p".to_string(),
            plugin: "RemoveFailedPods".to_string(),
            stage: ExtensionPoint::Filter,
        }
    );
}

#[test]
fn test_unknown_plugin() {
    let profile = Profile::new("p").with_plugin("Nope", json!({}), &[ExtensionPoint::Deschedule]);
    let err = ProfileExecutor::build(&profile, &plugins::registry(), &Handle::empty())
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::UnknownPlugin { plugin, .. } if plugin == "Nope"));
}

#[test]
fn test_invalid_args_reject_profile() {
    let profile = Profile::new("p").with_plugin(
        "RemoveFailedPods",
        json!({"unknownField": true}),
        &[ExtensionPoint::Deschedule],
    );
    assert!(matches!(
        ProfileExecutor::build(&profile, &plugins::registry(), &Handle::empty()),
        Err(ConfigError::InvalidArgs { .. })
    ));
}

struct Broken;

impl Plugin for Broken {
    fn name(&self) -> &str {
        "Broken"
    }
}

impl DeschedulePlugin for Broken {
    fn deschedule(&self, _node: &Node, _cycle: &CycleContext<'_>) -> Result<Nominations, PluginError> {
        Err(PluginError::new("Broken", "lister unavailable"))
    }
}

fn broken(_args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    Ok(PluginInstance::new("Broken").with_deschedule(Arc::new(Broken)))
}

#[tokio::test]
async fn test_failing_plugin_does_not_abort_profile() {
    let mut registry = plugins::registry();
    registry.register("Broken", &[ExtensionPoint::Deschedule], broken);

    let profile = Profile::new("p")
        .with_plugin("Broken", json!({}), &[ExtensionPoint::Deschedule])
        .with_plugin(
            "RemoveFailedPods",
            json!({}),
            &[ExtensionPoint::Deschedule],
        );
    let handle = Handle::from_snapshot(ClusterSnapshot::new(
        vec![node("n1")],
        vec![failed_pod("a", "n1", 60)],
        Vec::new(),
        Utc::now(),
    ));
    let executor = ProfileExecutor::build(&profile, &registry, &handle).unwrap();

    let report = executor
        .run(
            &handle,
            budget(
                EvictionLimits::unlimited(),
                Arc::new(RecordingEvictor::new()),
                EvictionMode::Live,
            ),
            &ExecutionOptions::default(),
        )
        .await;

    assert_eq!(outcomes(&report), vec![("a".to_string(), EvictionOutcome::Evicted)]);
}

struct Explosive;

impl Plugin for Explosive {
    fn name(&self) -> &str {
        "Explosive"
    }
}

impl FilterPlugin for Explosive {
    fn filter(&self, pod: &Pod) -> Verdict {
        if pod.name == "boom" {
            panic!("filter crashed on {}", pod.name);
        }
        Verdict::Admit
    }
}

fn explosive(_args: &serde_json::Value, _handle: &Handle) -> Result<PluginInstance, ConfigError> {
    Ok(PluginInstance::new("Explosive").with_filter(Arc::new(Explosive)))
}

#[tokio::test]
async fn test_panicking_filter_keeps_every_candidate_accounted() {
    let mut registry = plugins::registry();
    registry.register("Explosive", &[ExtensionPoint::Filter], explosive);

    let profile = Profile::new("p")
        .with_plugin("Explosive", json!({}), &[ExtensionPoint::Filter])
        .with_plugin("RemoveFailedPods", json!({}), &[ExtensionPoint::Deschedule]);
    let handle = Handle::from_snapshot(ClusterSnapshot::new(
        vec![node("n1"), node("n2")],
        vec![
            failed_pod("a", "n1", 60),
            failed_pod("boom", "n1", 60),
            failed_pod("c", "n1", 60),
            failed_pod("d", "n2", 60),
        ],
        Vec::new(),
        Utc::now(),
    ));
    let executor = ProfileExecutor::build(&profile, &registry, &handle).unwrap();
    let evictor = Arc::new(RecordingEvictor::new());
    let budget = budget(EvictionLimits::unlimited(), evictor.clone(), EvictionMode::Live);
    let options = ExecutionOptions {
        max_parallel_nodes: 2,
        ..Default::default()
    };

    let report = executor.run(&handle, budget.clone(), &options).await;

    let panicked = |outcome: &EvictionOutcome| {
        matches!(outcome, EvictionOutcome::Failed(FailureReason::TaskPanicked, _))
    };
    let results = outcomes(&report);
    let names: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["a", "boom", "c", "d"]);
    assert_eq!(results[0].1, EvictionOutcome::Evicted);
    assert!(panicked(&results[1].1));
    assert!(panicked(&results[2].1));
    assert_eq!(results[3].1, EvictionOutcome::Evicted);

    let mut summary = RunSummary::default();
    summary.record_report(&report);
    assert_eq!(summary.candidates(), 4);
    assert_eq!(summary.by_failure[&FailureReason::TaskPanicked], 2);
    assert_eq!(summary.evicted + summary.not_evicted_by_reason(), 4);
    assert_eq!(budget.total_evicted() as usize, evictor.calls().len());
}

#[tokio::test]
async fn test_cancel_during_eviction_lets_attempt_finish() {
    let handle = Handle::from_snapshot(ClusterSnapshot::new(
        vec![node("n1")],
        vec![
            failed_pod("a", "n1", 60),
            failed_pod("b", "n1", 60),
            failed_pod("c", "n1", 60),
        ],
        Vec::new(),
        Utc::now(),
    ));
    let executor = ProfileExecutor::build(
        &failed_pods_profile(0, json!({})),
        &plugins::registry(),
        &handle,
    )
    .unwrap();
    let evictor =
        Arc::new(RecordingEvictor::new().with_latency(std::time::Duration::from_millis(200)));
    let budget = budget(EvictionLimits::unlimited(), evictor.clone(), EvictionMode::Live);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let options = ExecutionOptions {
        max_parallel_nodes: 1,
        cancel: Cancellation::none().with_signal(stop_rx),
    };

    let running = executor.run(&handle, budget.clone(), &options);
    let stop = async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop_tx.send_replace(true);
    };
    let (report, _) = tokio::join!(running, stop);

    assert_eq!(
        outcomes(&report),
        vec![
            ("a".to_string(), EvictionOutcome::Evicted),
            (
                "b".to_string(),
                EvictionOutcome::Skipped(SkipReason::DeadlineExceeded)
            ),
            (
                "c".to_string(),
                EvictionOutcome::Skipped(SkipReason::DeadlineExceeded)
            ),
        ]
    );
    assert_eq!(budget.total_evicted() as usize, evictor.calls().len());
    assert_eq!(evictor.evicted(), vec!["default/a".to_string()]);

    let mut summary = RunSummary::default();
    summary.record_report(&report);
    assert!(summary.deadline_exceeded);
    assert_eq!(summary.candidates(), 3);
    assert_eq!(summary.evicted + summary.not_evicted_by_reason(), summary.candidates());
    assert_eq!(summary.by_reason[&SkipReason::DeadlineExceeded], 2);
}

#[tokio::test]
async fn test_transient_failures_show_up_by_reason() {
    let handle = Handle::from_snapshot(ClusterSnapshot::new(
        vec![node("n1")],
        vec![failed_pod("a", "n1", 60)],
        Vec::new(),
        Utc::now(),
    ));
    let executor = ProfileExecutor::build(
        &failed_pods_profile(0, json!({})),
        &plugins::registry(),
        &handle,
    )
    .unwrap();
    let evictor = Arc::new(RecordingEvictor::new());
    evictor.fail_with("default/a", EvictError::Other("apiserver unavailable".into()));

    let report = executor
        .run(
            &handle,
            budget(EvictionLimits::unlimited(), evictor.clone(), EvictionMode::Live),
            &ExecutionOptions::default(),
        )
        .await;

    let mut summary = RunSummary::default();
    summary.record_report(&report);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.by_failure[&FailureReason::RetriesExhausted], 1);
    assert_eq!(summary.not_evicted_by_reason(), summary.candidates());
}
