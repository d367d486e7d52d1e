//! Per-cycle run summary

use crate::error::ConfigError;
use crate::evictions::{EvictionOutcome, FailureReason, SkipReason};
use crate::framework::ProfileReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome counts for one node or namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub evicted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &EvictionOutcome) {
        match outcome {
            EvictionOutcome::Evicted => self.evicted += 1,
            EvictionOutcome::Skipped(_) => self.skipped += 1,
            EvictionOutcome::Failed(..) => self.failed += 1,
        }
    }
}

/// A profile that was not run because it could not be built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFailure {
    pub profile: String,
    pub error: String,
}

/// What one descheduling cycle did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
    pub evicted: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(default)]
    pub nodes_considered: usize,
    #[serde(default)]
    pub deadline_exceeded: bool,
    #[serde(default)]
    pub by_node: BTreeMap<String, OutcomeCounts>,
    #[serde(default)]
    pub by_namespace: BTreeMap<String, OutcomeCounts>,
    #[serde(default)]
    pub by_reason: BTreeMap<SkipReason, usize>,
    #[serde(default)]
    pub by_failure: BTreeMap<FailureReason, usize>,
    #[serde(default)]
    pub by_profile: BTreeMap<String, OutcomeCounts>,
    #[serde(default)]
    pub profile_errors: Vec<ProfileFailure>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            started_at: Some(started_at),
            dry_run,
            ..Default::default()
        }
    }

    /// Fold one profile's results into the totals
    pub fn record_report(&mut self, report: &ProfileReport) {
        self.nodes_considered = self.nodes_considered.max(report.nodes_considered);
        let profile = self.by_profile.entry(report.profile.clone()).or_default();

        for result in &report.results {
            let outcome = &result.outcome;
            profile.record(outcome);
            match outcome {
                EvictionOutcome::Evicted => self.evicted += 1,
                EvictionOutcome::Skipped(reason) => {
                    self.skipped += 1;
                    *self.by_reason.entry(*reason).or_default() += 1;
                    if *reason == SkipReason::DeadlineExceeded {
                        self.deadline_exceeded = true;
                    }
                }
                EvictionOutcome::Failed(reason, _) => {
                    self.failed += 1;
                    *self.by_failure.entry(*reason).or_default() += 1;
                }
            }
            self.by_node
                .entry(result.candidate.node.clone())
                .or_default()
                .record(outcome);
            self.by_namespace
                .entry(result.candidate.pod.namespace.clone())
                .or_default()
                .record(outcome);
        }
    }

    pub fn record_profile_error(&mut self, profile: &str, error: &ConfigError) {
        self.profile_errors.push(ProfileFailure {
            profile: profile.to_string(),
            error: error.to_string(),
        });
    }

    /// Candidates that reached the eviction stage
    pub fn candidates(&self) -> usize {
        self.evicted + self.skipped + self.failed
    }

    /// Candidates not evicted, summed over every skip and failure reason;
    /// always `skipped + failed`
    pub fn not_evicted_by_reason(&self) -> usize {
        self.by_reason.values().sum::<usize>() + self.by_failure.values().sum::<usize>()
    }
}
