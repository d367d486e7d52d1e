//! Pipeline stages of a profile run
//!
//! Ordering (PreSort + Sort) and nomination (Deschedule + Balance) are
//! synchronous passes over the snapshot. Admission and eviction run per node
//! batch, with up to `max_parallel_nodes` batches in flight; the results are
//! merged back in node order.

use super::cancel::Cancellation;
use super::filter::FilterChain;
use super::types::{
    BalancePlugin, BalanceRound, Candidate, CandidateResult, CycleContext, DeschedulePlugin,
    Nomination, Nominations, PreSortPlugin, SortKeys, SortPlugin, Verdict,
};
use crate::api::ExtensionPoint;
use crate::error::PluginError;
use crate::evictions::{EvictionBudget, EvictionOutcome, FailureReason, SkipReason};
use crate::models::Node;
use crate::observability::DeschedulerMetrics;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// A nominated pod waiting for admission
#[derive(Debug, Clone)]
pub struct Nominated {
    pub candidate: Candidate,
    /// Set when the nominating plugin held the pod back
    pub hold: Option<SkipReason>,
}

/// Nominations of one node, in production order
#[derive(Debug, Clone)]
pub struct NodeBatch {
    pub node: String,
    pub entries: Vec<Nominated>,
}

fn report_plugin_error(profile: &str, stage: ExtensionPoint, err: &PluginError) {
    warn!(
        profile = %profile,
        plugin = %err.plugin,
        stage = %stage,
        error = %err.message,
        "Plugin evaluation failed"
    );
    DeschedulerMetrics::new().inc_plugin_errors(&err.plugin, &stage.to_string());
}

/// PreSort keys then lexicographic Sort comparators
pub struct OrderingStage<'p> {
    pub profile: &'p str,
    pub pre_sort: &'p [Arc<dyn PreSortPlugin>],
    pub sort: &'p [Arc<dyn SortPlugin>],
}

impl<'p> OrderingStage<'p> {
    pub fn run<'n>(&self, nodes: &'n [Node], cycle: &CycleContext<'_>) -> Vec<&'n Node> {
        let mut ordered: Vec<&Node> = nodes.iter().collect();
        if self.sort.is_empty() && self.pre_sort.is_empty() {
            return ordered;
        }

        let mut keys = SortKeys::default();
        let mut failed = HashSet::new();
        for plugin in self.pre_sort {
            if let Err(err) = plugin.pre_sort(cycle, &mut keys) {
                report_plugin_error(self.profile, ExtensionPoint::PreSort, &err);
                failed.insert(plugin.name().to_string());
            }
        }

        let comparators: Vec<&Arc<dyn SortPlugin>> = self
            .sort
            .iter()
            .filter(|plugin| !failed.contains(plugin.name()))
            .collect();
        if comparators.is_empty() {
            return ordered;
        }

        ordered.sort_by(|a, b| {
            comparators
                .iter()
                .map(|plugin| plugin.compare(a, b, &keys))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.name.cmp(&b.name))
        });
        ordered
    }
}

/// Deschedule plugins then Balance rounds, node by node
pub struct NominationStage<'p> {
    pub profile: &'p str,
    pub deschedule: &'p [Arc<dyn DeschedulePlugin>],
    pub balance: &'p [Arc<dyn BalancePlugin>],
}

impl<'p> NominationStage<'p> {
    pub fn run(&self, nodes: &[&Node], cycle: &CycleContext<'_>) -> Vec<NodeBatch> {
        let mut rounds: Vec<(&str, Box<dyn BalanceRound + 'p>)> = Vec::new();
        for plugin in self.balance {
            match plugin.plan(cycle) {
                Ok(round) => rounds.push((plugin.name(), round)),
                Err(err) => report_plugin_error(self.profile, ExtensionPoint::Balance, &err),
            }
        }

        let mut batches = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut entries = Vec::new();

            for plugin in self.deschedule {
                match plugin.deschedule(node, cycle) {
                    Ok(nominations) => {
                        self.collect(&mut entries, node, plugin.name(), nominations)
                    }
                    Err(err) => report_plugin_error(self.profile, ExtensionPoint::Deschedule, &err),
                }
            }

            for (name, round) in rounds.iter_mut() {
                if round.satisfied() {
                    continue;
                }
                match round.balance(node, cycle) {
                    Ok(nominations) => self.collect(&mut entries, node, *name, nominations),
                    Err(err) => report_plugin_error(self.profile, ExtensionPoint::Balance, &err),
                }
            }

            batches.push(NodeBatch {
                node: node.name.clone(),
                entries,
            });
        }
        batches
    }

    fn collect(&self, entries: &mut Vec<Nominated>, node: &Node, plugin: &str, nominations: Nominations) {
        for nomination in nominations {
            let (pod, hold) = match nomination {
                Nomination::Evict(pod) => (pod, None),
                Nomination::Hold(pod, reason) => (pod, Some(reason)),
            };
            entries.push(Nominated {
                candidate: Candidate::new(pod, node.name.as_str(), self.profile, plugin),
                hold,
            });
        }
    }
}

/// Filter chain admission and budgeted eviction
pub struct EvictionStage {
    pub filter: FilterChain,
    pub pre_eviction: FilterChain,
    pub budget: Arc<EvictionBudget>,
    pub max_parallel_nodes: usize,
}

/// Results of one node batch, shared with the task that produces them so
/// finished entries survive a panic in a later one
#[derive(Default)]
struct BatchProgress {
    results: Mutex<Vec<CandidateResult>>,
}

impl BatchProgress {
    fn push(&self, result: CandidateResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    fn take(&self) -> Vec<CandidateResult> {
        std::mem::take(&mut *self.results.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EvictionStage {
    pub async fn run(&self, batches: Vec<NodeBatch>, cancel: &Cancellation) -> Vec<CandidateResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_nodes.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending = Vec::with_capacity(batches.len());

        for batch in batches {
            // Acquire before spawning so batches start in node order
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let progress = Arc::new(BatchProgress::default());
            let candidates: Vec<Candidate> =
                batch.entries.iter().map(|e| e.candidate.clone()).collect();
            pending.push((batch.node.clone(), candidates, progress.clone()));

            let filter = self.filter.clone();
            let pre_eviction = self.pre_eviction.clone();
            let budget = self.budget.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                process_batch(batch, &filter, &pre_eviction, &budget, &cancel, &progress).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Eviction task failed");
            }
        }

        let mut merged = Vec::new();
        for (node, candidates, progress) in pending {
            let mut results = progress.take();
            let done = results.len();
            if done < candidates.len() {
                error!(node = %node, candidates = candidates.len() - done, "Node batch aborted, recording remaining candidates as failed");
                results.extend(candidates.into_iter().skip(done).map(|candidate| {
                    CandidateResult {
                        candidate,
                        outcome: EvictionOutcome::Failed(
                            FailureReason::TaskPanicked,
                            format!("eviction task for node {} panicked", node),
                        ),
                    }
                }));
            }
            merged.extend(results);
        }
        merged
    }
}

async fn process_batch(
    batch: NodeBatch,
    filter: &FilterChain,
    pre_eviction: &FilterChain,
    budget: &EvictionBudget,
    cancel: &Cancellation,
    progress: &BatchProgress,
) {
    for Nominated { candidate, hold } in batch.entries {
        let outcome = if cancel.is_cancelled() {
            EvictionOutcome::Skipped(SkipReason::DeadlineExceeded)
        } else if let Some(reason) = hold {
            debug!(pod = %candidate.pod.key(), plugin = %candidate.plugin, reason = %reason, "Candidate held by plugin");
            EvictionOutcome::Skipped(reason)
        } else {
            match filter.evaluate(&candidate.pod) {
                Verdict::Reject { plugin, reason } => {
                    debug!(pod = %candidate.pod.key(), filter = %plugin, reason = %reason, "Candidate rejected by filter");
                    EvictionOutcome::Skipped(SkipReason::FilterRejected)
                }
                Verdict::Admit => budget.try_evict(&candidate, pre_eviction).await,
            }
        };
        progress.push(CandidateResult { candidate, outcome });
    }
}
