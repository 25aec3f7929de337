//! Scheduler: the pass loop
//!
//! ```text
//! Idle ──> Running ──> (Sleeping ──> Running)* ──> Stopped
//! ```
//!
//! A pass visits every tenant and every selected endpoint, classifies, then
//! applies. The stop token is only looked at before a pass and during the
//! sleep, so a pass that has started always runs to completion.

use crate::catalog::{Catalog, TenantDirectory};
use crate::classifier::{Classifier, ClassifierConfig, EndpointFailure, EndpointOutcome};
use crate::error::CatalogResult;
use crate::executor::ActionExecutor;
use crate::metrics::{PassStats, PassStatsBuilder};
use crate::policy::PolicyStore;
use crate::types::Decision;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Lifecycle of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Sleeping,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Sleeping => "sleeping",
            SchedulerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How [`Scheduler::run`] loops
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Execute exactly one pass, then stop
    pub run_once: bool,

    /// Delay between passes in continuous mode
    pub sleep_time: Duration,

    /// Apply decisions to the catalog instead of only logging them
    pub active_mode: bool,

    /// Re-read the policy document before every pass after the first
    pub reload_policy_each_pass: bool,

    /// Stop after this many passes even in continuous mode
    pub max_passes: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_once: false,
            sleep_time: Duration::from_secs(3600),
            active_mode: false,
            reload_policy_each_pass: false,
            max_passes: None,
        }
    }
}

/// Everything one pass produced
#[derive(Debug, Clone)]
pub struct PassReport {
    pub stats: PassStats,
    pub outcomes: Vec<EndpointOutcome>,
    pub failures: Vec<EndpointFailure>,
}

impl PassReport {
    /// All decisions of the pass, ordered by tenant, endpoint, then replica
    pub fn decisions(&self) -> impl Iterator<Item = &Decision> {
        self.outcomes.iter().flat_map(|o| o.decisions.iter())
    }
}

/// What a call to [`Scheduler::run`] did
#[derive(Debug, Clone, Default)]
pub struct PassHistory {
    /// Passes completed
    pub passes: usize,

    /// Whether the loop ended because the stop token was cancelled
    pub cancelled: bool,

    /// Report of the most recent pass
    pub last: Option<PassReport>,
}

/// Drives classification and execution passes
pub struct Scheduler {
    classifier: Classifier,
    executor: ActionExecutor,
    policy: Arc<PolicyStore>,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(classifier: Classifier, executor: ActionExecutor, policy: Arc<PolicyStore>) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            classifier,
            executor,
            policy,
            state,
        }
    }

    /// Wire every catalog role to the same backend
    pub fn with_catalog<C>(catalog: Arc<C>, policy: Arc<PolicyStore>, config: ClassifierConfig) -> Self
    where
        C: Catalog + 'static,
    {
        let classifier = Classifier::new(catalog.clone(), catalog.clone(), catalog.clone(), config);
        let executor = ActionExecutor::new(catalog);
        Self::new(classifier, executor, policy)
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Loop over passes until run-once, `max_passes` or cancellation
    pub async fn run(
        &self,
        options: RunOptions,
        tenants: &[String],
        cancel: CancellationToken,
    ) -> PassHistory {
        info!(
            tenants = tenants.len(),
            run_once = options.run_once,
            active_mode = options.active_mode,
            sleep_s = options.sleep_time.as_secs(),
            "🛡️  Recoverer active"
        );

        let mut history = PassHistory::default();

        loop {
            if cancel.is_cancelled() {
                info!("Stop requested, not starting another pass");
                history.cancelled = true;
                break;
            }

            self.set_state(SchedulerState::Running);

            if options.reload_policy_each_pass && history.passes > 0 {
                if let Err(e) = self.policy.reload() {
                    error!(error = %e, "Policy reload failed, keeping the previous policy");
                }
            }

            let report = self.run_pass(tenants, options.active_mode).await;
            history.passes += 1;
            history.last = Some(report);

            let bounded = options
                .max_passes
                .is_some_and(|max| history.passes >= max);
            if options.run_once || bounded {
                break;
            }

            self.set_state(SchedulerState::Sleeping);
            info!(sleep_s = options.sleep_time.as_secs(), "💤 Sleeping until next pass");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stop requested during sleep");
                    history.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(options.sleep_time) => {}
            }
        }

        self.set_state(SchedulerState::Stopped);
        info!(passes = history.passes, "Recoverer stopped");
        history
    }

    /// Execute one full pass over `tenants`
    ///
    /// Note: Public for integration testing
    pub async fn run_pass(&self, tenants: &[String], active_mode: bool) -> PassReport {
        info!(tenants = tenants.len(), active_mode, "🔭 Starting pass");

        let policy = self.policy.snapshot();
        let mut stats = PassStatsBuilder::new();
        let mut outcomes = Vec::new();
        let mut failures = Vec::new();

        for tenant in tenants {
            // Every classification and apply log line carries the tenant
            let span = info_span!("tenant", tenant = %tenant);
            let (classification, reports) = async {
                let classification = self.classifier.classify_tenant(tenant, &policy).await;
                let mut reports = Vec::with_capacity(classification.outcomes.len());
                for outcome in &classification.outcomes {
                    reports.push(
                        self.executor
                            .apply_all(&outcome.decisions, active_mode)
                            .await,
                    );
                }
                (classification, reports)
            }
            .instrument(span)
            .await;

            stats.record_tenant(&classification);
            for report in &reports {
                stats.record_actions(report);
            }

            outcomes.extend(classification.outcomes);
            failures.extend(classification.failures);
        }

        let stats = stats.finish();
        info!("📊 {}", stats.summary());

        if stats.endpoints_quarantined > 0 {
            warn!(
                endpoints = stats.endpoints_quarantined,
                "Endpoints with suspected endpoint-level faults"
            );
        }
        if stats.has_failures() {
            error!(
                endpoints_failed = stats.endpoints_failed,
                actions_failed = stats.actions_failed,
                "Pass completed with skipped work, retrying next pass"
            );
        }

        PassReport {
            stats,
            outcomes,
            failures,
        }
    }
}

/// Resolve the tenant set once at startup
///
/// With no explicit list every known tenant is used. Requested tenants the
/// catalog does not know are dropped with a warning.
pub async fn resolve_tenants(
    directory: &dyn TenantDirectory,
    requested: Option<&[String]>,
) -> CatalogResult<Vec<String>> {
    let known = directory.list_tenants().await?;

    let Some(requested) = requested else {
        return Ok(known);
    };

    let (valid, invalid): (Vec<String>, Vec<String>) = requested
        .iter()
        .cloned()
        .partition(|t| known.contains(t));

    if !invalid.is_empty() {
        warn!(invalid = ?invalid, "Ignoring unknown tenants");
    }

    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCatalog;
    use crate::policy::{Policy, PolicyDefaults};
    use crate::test_logs::CapturedLogs;
    use crate::types::{ReplicaIdentity, ReplicaState};

    fn scheduler(catalog: &Arc<MemoryCatalog>) -> Scheduler {
        let policy = Arc::new(PolicyStore::from_policy(Policy::empty(
            PolicyDefaults::default(),
        )));
        Scheduler::with_catalog(catalog.clone(), policy, ClassifierConfig::default())
    }

    fn seeded() -> Arc<MemoryCatalog> {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint("def", "X");
        let id = ReplicaIdentity::new("data18", "f1");
        catalog.add_replica(&id, "X", ReplicaState::Available);
        catalog.add_replica(&id, "Y", ReplicaState::Available);
        catalog.report_suspicious_times(&id, "X", 11);
        catalog
    }

    fn tenants() -> Vec<String> {
        vec!["def".to_string()]
    }

    #[tokio::test]
    async fn test_decision_logs_carry_tenant() {
        let (logs, _guard) = CapturedLogs::install();
        let catalog = seeded();

        scheduler(&catalog).run_pass(&tenants(), false).await;

        let line = logs
            .line_with("Dry-run decision")
            .expect("dry-run decision logged");
        for field in [
            "tenant{tenant=def}",
            "endpoint=X",
            "scope=data18",
            "name=f1",
            "action=escalate",
            "reason=",
            "report_count=11",
        ] {
            assert!(line.contains(field), "missing {field} in {line}");
        }
    }

    #[tokio::test]
    async fn test_probe_failure_log_carries_tenant() {
        let (logs, _guard) = CapturedLogs::install();
        let catalog = seeded();
        catalog.fail_probe_for(&ReplicaIdentity::new("data18", "f1"));

        scheduler(&catalog).run_pass(&tenants(), false).await;

        let line = logs
            .line_with("Availability probe failed")
            .expect("probe failure logged");
        assert!(line.contains("tenant{tenant=def}"), "{line}");
        assert!(line.contains("endpoint=X"), "{line}");
    }

    #[tokio::test]
    async fn test_initial_state_is_idle() {
        let catalog = seeded();
        assert_eq!(scheduler(&catalog).state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_run_once_executes_one_pass() {
        let catalog = seeded();
        let s = scheduler(&catalog);

        let options = RunOptions {
            run_once: true,
            ..Default::default()
        };
        let history = s.run(options, &tenants(), CancellationToken::new()).await;

        assert_eq!(history.passes, 1);
        assert!(!history.cancelled);
        assert_eq!(s.state(), SchedulerState::Stopped);
        assert_eq!(catalog.query_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_mode_sleeps_between_passes() {
        let catalog = seeded();
        let s = scheduler(&catalog);

        let options = RunOptions {
            sleep_time: Duration::from_secs(60),
            max_passes: Some(3),
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        let history = s.run(options, &tenants(), CancellationToken::new()).await;

        assert_eq!(history.passes, 3);
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(start.elapsed() < Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let catalog = seeded();
        let s = scheduler(&catalog);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let history = s.run(RunOptions::default(), &tenants(), cancel).await;

        assert_eq!(history.passes, 0);
        assert!(history.cancelled);
        assert_eq!(catalog.query_count(), 0);
        assert_eq!(s.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_stops_promptly() {
        let catalog = seeded();
        let s = Arc::new(scheduler(&catalog));
        let cancel = CancellationToken::new();
        let mut state = s.subscribe();

        let handle = {
            let s = s.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let tenants = tenants();
                s.run(RunOptions::default(), &tenants, cancel).await
            })
        };

        state
            .wait_for(|st| *st == SchedulerState::Sleeping)
            .await
            .unwrap();
        cancel.cancel();

        let history = handle.await.unwrap();
        assert_eq!(history.passes, 1);
        assert!(history.cancelled);
        assert_eq!(s.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_pass_report_collects_decisions() {
        let catalog = seeded();
        let s = scheduler(&catalog);

        let report = s.run_pass(&tenants(), true).await;

        assert_eq!(report.decisions().count(), 1);
        assert_eq!(report.stats.escalated, 1);
        assert_eq!(report.stats.actions_applied, 1);
        assert_eq!(
            catalog.state_of(&ReplicaIdentity::new("data18", "f1"), "X"),
            Some(ReplicaState::Bad)
        );
    }

    #[tokio::test]
    async fn test_resolve_tenants() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("def", "X");
        catalog.add_tenant("atlas");

        let all = resolve_tenants(&catalog, None).await.unwrap();
        assert_eq!(all, vec!["atlas".to_string(), "def".to_string()]);

        let requested = vec!["def".to_string(), "nope".to_string()];
        let some = resolve_tenants(&catalog, Some(&requested)).await.unwrap();
        assert_eq!(some, vec!["def".to_string()]);
    }
}
