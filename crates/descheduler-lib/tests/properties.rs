//! Property-based tests for the eviction budget and the filter chain.
//!
//! Run with: `cargo test --test properties`

use chrono::{Duration as ChronoDuration, Utc};
use descheduler_lib::api::{ExtensionPoint, Policy, Profile};
use descheduler_lib::cluster::StaticSnapshotSource;
use descheduler_lib::framework::{FilterChain, FilterPlugin, Handle, Plugin, Verdict};
use descheduler_lib::models::{Node, Pod, PodPhase, ResourceList};
use descheduler_lib::plugins::default_evictor::{DefaultEvictor, DefaultEvictorArgs};
use descheduler_lib::{Cancellation, Descheduler, DeschedulerOptions, RecordingEvictor, RunSummary};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Strategies
// =============================================================================

/// (node index, namespace index, failed) per pod
fn pods_strategy() -> impl Strategy<Value = Vec<(usize, usize, bool)>> {
    prop::collection::vec((0..4usize, 0..3usize, any::<bool>()), 0..40)
}

fn limit_strategy() -> impl Strategy<Value = Option<u32>> {
    prop_oneof![Just(None), (0..6u32).prop_map(Some)]
}

fn cluster(pods: &[(usize, usize, bool)]) -> StaticSnapshotSource {
    let nodes = (0..4)
        .map(|i| Node::new(format!("node-{i}"), ResourceList::new(4000, 8 << 30, 110)))
        .collect();
    let pods = pods
        .iter()
        .enumerate()
        .map(|(i, (node, ns, failed))| {
            let phase = if *failed { PodPhase::Failed } else { PodPhase::Running };
            Pod::new(format!("ns-{ns}"), format!("pod-{i}"))
                .on_node(format!("node-{node}"))
                .owned_by("ReplicaSet", "app")
                .with_phase(phase)
                .started_at(Utc::now() - ChronoDuration::hours(2))
        })
        .collect();
    StaticSnapshotSource::new(nodes, pods)
}

fn policy(per_node: Option<u32>, per_namespace: Option<u32>, total: Option<u32>) -> Policy {
    Policy {
        max_no_of_pods_to_evict_per_node: per_node,
        max_no_of_pods_to_evict_per_namespace: per_namespace,
        max_no_of_pods_to_evict_total: total,
        profiles: vec![Profile::new("default")
            .with_plugin(
                "DefaultEvictor",
                json!({}),
                &[ExtensionPoint::Filter, ExtensionPoint::PreEvictionFilter],
            )
            .with_plugin(
                "PodLifeTime",
                json!({"maxPodLifeTimeSeconds": 60}),
                &[ExtensionPoint::Deschedule],
            )
            .with_plugin("RemoveFailedPods", json!({}), &[ExtensionPoint::Deschedule])],
        ..Default::default()
    }
}

fn run_cycle(
    policy: Policy,
    source: StaticSnapshotSource,
    dry_run: bool,
    max_parallel_nodes: usize,
) -> (RunSummary, Arc<RecordingEvictor>) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let evictor = Arc::new(RecordingEvictor::new());
    let options = DeschedulerOptions {
        dry_run,
        max_parallel_nodes,
        ..Default::default()
    };
    let descheduler = Descheduler::new(policy, Arc::new(source), evictor.clone(), options).unwrap();
    let summary = runtime
        .block_on(descheduler.run_once(&Cancellation::none()))
        .unwrap();
    (summary, evictor)
}

/// Filter rejecting pods in one namespace
struct NamespaceFence(String);

impl Plugin for NamespaceFence {
    fn name(&self) -> &str {
        "NamespaceFence"
    }
}

impl FilterPlugin for NamespaceFence {
    fn filter(&self, pod: &Pod) -> Verdict {
        if pod.namespace == self.0 {
            Verdict::reject("NamespaceFence", "fenced namespace")
        } else {
            Verdict::Admit
        }
    }
}

/// Filter rejecting pods whose name ends in an odd digit
struct OddPods;

impl Plugin for OddPods {
    fn name(&self) -> &str {
        "OddPods"
    }
}

impl FilterPlugin for OddPods {
    fn filter(&self, pod: &Pod) -> Verdict {
        let odd = pod
            .name
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .map(|d| d % 2 == 1)
            .unwrap_or(false);
        if odd {
            Verdict::reject("OddPods", "odd pod")
        } else {
            Verdict::Admit
        }
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Committed evictions never exceed any ceiling, whatever the parallelism
    #[test]
    fn ceilings_hold_under_concurrency(
        pods in pods_strategy(),
        per_node in limit_strategy(),
        per_namespace in limit_strategy(),
        total in limit_strategy(),
        parallel in 1..5usize,
    ) {
        let (summary, evictor) = run_cycle(
            policy(per_node, per_namespace, total),
            cluster(&pods),
            false,
            parallel,
        );

        let calls = evictor.calls();
        prop_assert_eq!(calls.len(), summary.evicted);

        let mut by_node: HashMap<String, u32> = HashMap::new();
        let mut by_namespace: HashMap<String, u32> = HashMap::new();
        for call in &calls {
            *by_node.entry(call.node.clone().unwrap_or_default()).or_default() += 1;
            let namespace = call.pod.split('/').next().unwrap_or_default().to_string();
            *by_namespace.entry(namespace).or_default() += 1;
        }

        if let Some(limit) = per_node {
            prop_assert!(by_node.values().all(|n| *n <= limit));
        }
        if let Some(limit) = per_namespace {
            prop_assert!(by_namespace.values().all(|n| *n <= limit));
        }
        if let Some(limit) = total {
            prop_assert!(calls.len() as u32 <= limit);
        }

        // every pod is nominated by at least one plugin, failed pods by both
        let nominated: usize = pods.iter().map(|(_, _, failed)| if *failed { 2 } else { 1 }).sum();
        prop_assert_eq!(summary.candidates(), nominated);
        prop_assert_eq!(summary.evicted + summary.not_evicted_by_reason(), summary.candidates());
    }

    /// A dry run reports exactly what a live run would have done
    #[test]
    fn dry_run_summary_matches_live(
        pods in pods_strategy(),
        per_node in limit_strategy(),
        total in limit_strategy(),
    ) {
        let (live, _) = run_cycle(policy(per_node, None, total), cluster(&pods), false, 1);
        let (dry, evictor) = run_cycle(policy(per_node, None, total), cluster(&pods), true, 1);

        prop_assert!(evictor.calls().is_empty());
        prop_assert_eq!(live.evicted, dry.evicted);
        prop_assert_eq!(live.skipped, dry.skipped);
        prop_assert_eq!(live.by_node, dry.by_node);
        prop_assert_eq!(live.by_reason, dry.by_reason);
    }

    /// The chain's verdict does not depend on filter order
    #[test]
    fn filter_verdict_is_order_insensitive(
        pods in pods_strategy(),
        fenced in 0..3usize,
        rotation in 0..3usize,
        evict_failed_bare in any::<bool>(),
    ) {
        let evictor = DefaultEvictor::new(
            DefaultEvictorArgs {
                evict_failed_bare_pods: evict_failed_bare,
                ..Default::default()
            },
            Handle::empty(),
        )
        .unwrap();
        let mut filters: Vec<Arc<dyn FilterPlugin>> = vec![
            Arc::new(evictor),
            Arc::new(NamespaceFence(format!("ns-{fenced}"))),
            Arc::new(OddPods),
        ];
        let forward = FilterChain::new(filters.clone());
        filters.rotate_left(rotation);
        filters.reverse();
        let shuffled = FilterChain::new(filters);

        for (i, (_, ns, _)) in pods.iter().enumerate() {
            let pod = Pod::new(format!("ns-{ns}"), format!("pod-{i}")).owned_by("ReplicaSet", "app");
            prop_assert_eq!(forward.is_evictable(&pod), shuffled.is_evictable(&pod));
        }
    }

    /// Arbitrary text never panics the policy parser
    #[test]
    fn policy_parse_never_panics(raw in ".{0,400}") {
        let _ = Policy::from_yaml_str(&raw);
        let _ = Policy::from_json_str(&raw);
    }
}
