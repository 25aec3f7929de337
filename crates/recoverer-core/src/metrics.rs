//! Pass Metrics
//!
//! Tracks what each recoverer pass looked at, decided and applied.

use crate::classifier::{EndpointOutcome, TenantClassification};
use crate::executor::ApplyReport;
use crate::types::Action;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Statistics from a single pass over all tenants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    /// Tenants visited
    pub tenants: usize,

    /// Endpoints classified
    pub endpoints_evaluated: usize,

    /// Endpoints skipped because the policy excludes them
    pub endpoints_excluded: usize,

    /// Endpoints (or tenant listings) skipped because of catalog errors
    pub endpoints_failed: usize,

    /// Endpoints whose candidate count exceeded the quarantine threshold
    pub endpoints_quarantined: usize,

    /// Replicas that met the report threshold
    pub candidates: usize,

    pub escalated: usize,
    pub quarantined: usize,
    pub ignored: usize,

    /// Catalog transitions performed
    pub actions_applied: usize,

    /// Catalog transitions that failed
    pub actions_failed: usize,

    /// Time taken to complete the pass
    pub duration: Option<Duration>,
}

impl PassStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total decisions taken during the pass
    pub fn decisions(&self) -> usize {
        self.escalated + self.quarantined + self.ignored
    }

    /// True when some endpoint or action was skipped because of an error
    pub fn has_failures(&self) -> bool {
        self.endpoints_failed > 0 || self.actions_failed > 0
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Pass: {} tenants | {} endpoints ({} excluded, {} failed, {} quarantined) | {} candidates: {} escalated, {} quarantined, {} ignored | Actions: {} applied, {} failed",
            self.tenants,
            self.endpoints_evaluated,
            self.endpoints_excluded,
            self.endpoints_failed,
            self.endpoints_quarantined,
            self.candidates,
            self.escalated,
            self.quarantined,
            self.ignored,
            self.actions_applied,
            self.actions_failed,
        )
    }
}

/// Accumulates stats while a pass runs
#[derive(Debug, Clone)]
pub struct PassStatsBuilder {
    stats: PassStats,
    start_time: Instant,
}

impl PassStatsBuilder {
    pub fn new() -> Self {
        Self {
            stats: PassStats::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_tenant(&mut self, classification: &TenantClassification) {
        self.stats.tenants += 1;
        self.stats.endpoints_excluded += classification.excluded.len();
        self.stats.endpoints_failed += classification.failures.len();
        for outcome in &classification.outcomes {
            self.record_endpoint(outcome);
        }
    }

    fn record_endpoint(&mut self, outcome: &EndpointOutcome) {
        self.stats.endpoints_evaluated += 1;
        if outcome.quarantined() {
            self.stats.endpoints_quarantined += 1;
        }
        self.stats.candidates += outcome.candidate_count;
        self.stats.escalated += outcome.count(Action::Escalate);
        self.stats.quarantined += outcome.count(Action::Quarantine);
        self.stats.ignored += outcome.count(Action::Ignore);
    }

    /// Record the results of applying one endpoint's decisions
    pub fn record_actions(&mut self, report: &ApplyReport) {
        self.stats.actions_applied += report.applied();
        self.stats.actions_failed += report.failed();
    }

    pub fn finish(mut self) -> PassStats {
        self.stats.duration = Some(self.start_time.elapsed());
        self.stats
    }

    pub fn stats(&self) -> &PassStats {
        &self.stats
    }
}

impl Default for PassStatsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
