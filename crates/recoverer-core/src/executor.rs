//! Executor: carries classifier decisions into the catalog
//!
//! In dry-run mode nothing is written; every decision is logged and reported
//! as [`ApplyOutcome::DryRun`]. In active mode, escalations and quarantines
//! request an idempotent transition out of SUSPICIOUS, and ignores make no
//! catalog call at all. A failed transition is reported for that replica
//! only; the rest of the batch still runs.

use crate::catalog::{ReplicaStateWriter, TransitionOutcome};
use crate::error::CatalogError;
use crate::types::{Action, Decision, ReplicaState};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of applying one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Dry-run: logged, not written
    DryRun,

    /// Ignore decision: nothing to do
    Skipped,

    /// The transition was applied
    Applied,

    /// The replica was already in the target state
    AlreadyInState,

    /// The replica had left SUSPICIOUS for some other state; left untouched
    StateChanged(ReplicaState),
}

impl ApplyOutcome {
    /// Whether the catalog was modified
    pub fn mutated(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

impl From<TransitionOutcome> for ApplyOutcome {
    fn from(outcome: TransitionOutcome) -> Self {
        match outcome {
            TransitionOutcome::Applied => ApplyOutcome::Applied,
            TransitionOutcome::AlreadyInState => ApplyOutcome::AlreadyInState,
            TransitionOutcome::StateChanged(actual) => ApplyOutcome::StateChanged(actual),
        }
    }
}

/// Per-replica results for a batch of decisions
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub results: Vec<(Decision, Result<ApplyOutcome, CatalogError>)>,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(o) if o.mutated()))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Decision, &CatalogError)> {
        self.results
            .iter()
            .filter_map(|(d, r)| r.as_ref().err().map(|e| (d, e)))
    }
}

/// Applies decisions through a [`ReplicaStateWriter`]
pub struct ActionExecutor {
    writer: Arc<dyn ReplicaStateWriter>,
}

impl ActionExecutor {
    pub fn new(writer: Arc<dyn ReplicaStateWriter>) -> Self {
        Self { writer }
    }

    /// Apply a single decision
    pub async fn apply(
        &self,
        decision: &Decision,
        active_mode: bool,
    ) -> Result<ApplyOutcome, CatalogError> {
        let record = &decision.record;

        if !active_mode {
            info!(
                endpoint = %record.endpoint,
                scope = %record.identity.scope,
                name = %record.identity.name,
                action = decision.action.as_str(),
                reason = %decision.reason,
                report_count = record.report_count,
                "Dry-run decision"
            );
            return Ok(ApplyOutcome::DryRun);
        }

        let Some(target) = decision.action.target_state() else {
            info!(
                endpoint = %record.endpoint,
                scope = %record.identity.scope,
                name = %record.identity.name,
                action = decision.action.as_str(),
                reason = %decision.reason,
                report_count = record.report_count,
                "Replica left suspicious"
            );
            return Ok(ApplyOutcome::Skipped);
        };

        let outcome: ApplyOutcome = self
            .writer
            .transition(
                &record.identity,
                &record.endpoint,
                ReplicaState::Suspicious,
                target,
            )
            .await?
            .into();

        match outcome {
            ApplyOutcome::StateChanged(actual) => warn!(
                endpoint = %record.endpoint,
                scope = %record.identity.scope,
                name = %record.identity.name,
                action = decision.action.as_str(),
                reason = %decision.reason,
                report_count = record.report_count,
                state = %actual,
                "Replica changed state since classification, left untouched"
            ),
            _ => info!(
                endpoint = %record.endpoint,
                scope = %record.identity.scope,
                name = %record.identity.name,
                action = decision.action.as_str(),
                reason = %decision.reason,
                report_count = record.report_count,
                outcome = ?outcome,
                "Decision applied"
            ),
        }

        Ok(outcome)
    }

    /// Apply every decision in order, never stopping on a failure
    pub async fn apply_all(&self, decisions: &[Decision], active_mode: bool) -> ApplyReport {
        let mut report = ApplyReport {
            results: Vec::with_capacity(decisions.len()),
        };

        for decision in decisions {
            let result = self.apply(decision, active_mode).await;
            if let Err(e) = &result {
                error!(
                    endpoint = %decision.record.endpoint,
                    replica = %decision.record.identity,
                    action = decision.action.as_str(),
                    error = %e,
                    "Failed to apply decision, replica skipped this pass"
                );
            }
            report.results.push((decision.clone(), result));
        }

        report
    }
}
