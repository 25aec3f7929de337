//! Classifier: turns suspicion counts into per-replica decisions
//!
//! For every endpoint of a tenant that the policy does not exclude:
//!
//! 1. Take one snapshot of the candidates (report count >= threshold within
//!    the window).
//! 2. More candidates than the endpoint's quarantine threshold means the
//!    endpoint itself is suspect: every candidate is quarantined and the
//!    availability probe is not consulted at all.
//! 3. Otherwise a candidate is escalated only when a copy is confirmed
//!    AVAILABLE on another endpoint. A missing copy, an ignore rule or a
//!    failed probe all leave the replica suspicious for the next pass.
//!
//! Decisions depend only on the current catalog state and policy, so running
//! the same pass twice over an unchanged catalog yields the same decisions.

use crate::catalog::{AvailabilityProbe, EndpointDirectory, SuspicionQuery};
use crate::error::CatalogError;
use crate::policy::{Policy, ResolvedPolicy};
use crate::types::{Action, Decision, DecisionReason, Endpoint, SuspiciousReplicaRecord};
use chrono::Duration;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pass-wide classification settings
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Trailing window for counting suspicion reports
    pub window: Duration,

    /// Glob selecting the endpoints to evaluate
    pub endpoint_pattern: String,

    /// How many endpoints of one tenant may be classified at once
    pub max_parallel_endpoints: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window: Duration::days(3),
            endpoint_pattern: "*".to_string(),
            max_parallel_endpoints: 1,
        }
    }
}

/// Decisions for one endpoint, all taken from the same candidate snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EndpointOutcome {
    pub tenant: String,
    pub endpoint: Endpoint,
    pub policy: ResolvedPolicy,
    pub candidate_count: usize,
    pub decisions: Vec<Decision>,
}

impl EndpointOutcome {
    /// Whether the endpoint tripped its quarantine threshold
    pub fn quarantined(&self) -> bool {
        self.candidate_count > self.policy.quarantine_threshold as usize
    }

    pub fn count(&self, action: Action) -> usize {
        self.decisions.iter().filter(|d| d.action == action).count()
    }
}

/// An endpoint (or a whole tenant, when `endpoint` is `None`) skipped this pass
#[derive(Debug, Clone)]
pub struct EndpointFailure {
    pub tenant: String,
    pub endpoint: Option<Endpoint>,
    pub error: CatalogError,
}

/// Everything the classifier produced for one tenant
#[derive(Debug, Clone, Default)]
pub struct TenantClassification {
    pub outcomes: Vec<EndpointOutcome>,
    pub excluded: Vec<Endpoint>,
    pub failures: Vec<EndpointFailure>,
}

/// The decision core
pub struct Classifier {
    directory: Arc<dyn EndpointDirectory>,
    query: Arc<dyn SuspicionQuery>,
    probe: Arc<dyn AvailabilityProbe>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(
        directory: Arc<dyn EndpointDirectory>,
        query: Arc<dyn SuspicionQuery>,
        probe: Arc<dyn AvailabilityProbe>,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            directory,
            query,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify every selected, non-excluded endpoint of a tenant
    ///
    /// A failure on one endpoint is recorded and does not affect the others.
    pub async fn classify_tenant(&self, tenant: &str, policy: &Policy) -> TenantClassification {
        let mut result = TenantClassification::default();

        let endpoints = match self
            .directory
            .list_endpoints(tenant, &self.config.endpoint_pattern)
            .await
        {
            Ok(endpoints) => endpoints,
            Err(error) => {
                warn!(tenant, error = %error, "Cannot list endpoints, skipping tenant this pass");
                result.failures.push(EndpointFailure {
                    tenant: tenant.to_string(),
                    endpoint: None,
                    error,
                });
                return result;
            }
        };

        let mut selected = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let resolved = policy.resolve(endpoint.as_str());
            if resolved.excluded {
                debug!(tenant, endpoint = %endpoint, pattern = ?resolved.matched_pattern, "Endpoint excluded by policy");
                result.excluded.push(endpoint);
            } else {
                selected.push((endpoint, resolved));
            }
        }

        let parallel = self.config.max_parallel_endpoints.max(1);
        let mut finished: Vec<(Endpoint, Result<EndpointOutcome, CatalogError>)> =
            futures::stream::iter(selected)
                .map(|(endpoint, resolved)| async move {
                    let outcome = self
                        .classify_endpoint(tenant, &endpoint, resolved, policy)
                        .await;
                    (endpoint, outcome)
                })
                .buffer_unordered(parallel)
                .collect()
                .await;

        finished.sort_by(|a, b| a.0.cmp(&b.0));

        for (endpoint, outcome) in finished {
            match outcome {
                Ok(outcome) => result.outcomes.push(outcome),
                Err(error) => {
                    warn!(tenant, endpoint = %endpoint, error = %error, "Endpoint skipped this pass");
                    result.failures.push(EndpointFailure {
                        tenant: tenant.to_string(),
                        endpoint: Some(endpoint),
                        error,
                    });
                }
            }
        }

        result
    }

    /// Classify the candidates of one endpoint
    ///
    /// Fails only if the candidate query fails; probe failures abstain.
    pub async fn classify_endpoint(
        &self,
        tenant: &str,
        endpoint: &Endpoint,
        resolved: ResolvedPolicy,
        policy: &Policy,
    ) -> Result<EndpointOutcome, CatalogError> {
        let mut candidates: Vec<SuspiciousReplicaRecord> = self
            .query
            .find(
                tenant,
                endpoint,
                self.config.window,
                resolved.report_threshold,
            )
            .await?
            .try_collect()
            .await?;

        candidates.sort_by(|a, b| a.identity.cmp(&b.identity));
        let candidate_count = candidates.len();

        let decisions = if candidate_count > resolved.quarantine_threshold as usize {
            warn!(
                tenant,
                endpoint = %endpoint,
                candidates = candidate_count,
                quarantine_threshold = resolved.quarantine_threshold,
                "Too many suspicious replicas, endpoint-level fault suspected"
            );
            quarantine_all(candidates)
        } else {
            self.settle(endpoint, candidates, policy).await
        };

        info!(
            tenant,
            endpoint = %endpoint,
            candidates = candidate_count,
            report_threshold = resolved.report_threshold,
            quarantine_threshold = resolved.quarantine_threshold,
            "Endpoint classified"
        );

        Ok(EndpointOutcome {
            tenant: tenant.to_string(),
            endpoint: endpoint.clone(),
            policy: resolved,
            candidate_count,
            decisions,
        })
    }

    async fn settle(
        &self,
        endpoint: &Endpoint,
        candidates: Vec<SuspiciousReplicaRecord>,
        policy: &Policy,
    ) -> Vec<Decision> {
        let to_probe: Vec<_> = candidates
            .iter()
            .filter(|c| !policy.is_ignored(&c.identity))
            .map(|c| c.identity.clone())
            .collect();

        let answers = if to_probe.is_empty() {
            Default::default()
        } else {
            self.probe.available_elsewhere(&to_probe, endpoint).await
        };

        candidates
            .into_iter()
            .map(|record| {
                if policy.is_ignored(&record.identity) {
                    return Decision::new(record, Action::Ignore, DecisionReason::IgnoreRule);
                }

                match answers.get(&record.identity) {
                    Some(Ok(true)) => {
                        Decision::new(record, Action::Escalate, DecisionReason::AvailableElsewhere)
                    }
                    Some(Ok(false)) => {
                        Decision::new(record, Action::Ignore, DecisionReason::NoSurvivingCopy)
                    }
                    Some(Err(error)) => {
                        warn!(
                            endpoint = %endpoint,
                            replica = %record.identity,
                            error = %error,
                            "Availability probe failed, abstaining"
                        );
                        Decision::new(record, Action::Ignore, DecisionReason::ProbeFailed)
                    }
                    None => Decision::new(record, Action::Ignore, DecisionReason::ProbeFailed),
                }
            })
            .collect()
    }
}

fn quarantine_all(candidates: Vec<SuspiciousReplicaRecord>) -> Vec<Decision> {
    candidates
        .into_iter()
        .map(|record| {
            Decision::new(
                record,
                Action::Quarantine,
                DecisionReason::EndpointFaultSuspected,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryCatalog;
    use crate::catalog::CandidateStream;
    use crate::error::CatalogResult;
    use crate::policy::{DocumentFormat, PolicyDefaults};
    use crate::types::{ReplicaIdentity, ReplicaState};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TENANT: &str = "def";

    fn id(name: &str) -> ReplicaIdentity {
        ReplicaIdentity::new("data18", name)
    }

    fn defaults() -> PolicyDefaults {
        PolicyDefaults {
            quarantine_threshold: 5,
            report_threshold: 10,
        }
    }

    /// Probe wrapper that counts calls
    struct CountingProbe {
        inner: Arc<MemoryCatalog>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AvailabilityProbe for CountingProbe {
        async fn has_available_elsewhere(
            &self,
            identity: &ReplicaIdentity,
            excluding: &Endpoint,
        ) -> CatalogResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.has_available_elsewhere(identity, excluding).await
        }
    }

    /// Query that ignores its inputs and returns a fixed list
    struct FixedQuery(Vec<SuspiciousReplicaRecord>);

    #[async_trait]
    impl SuspicionQuery for FixedQuery {
        async fn find(
            &self,
            _tenant: &str,
            _endpoint: &Endpoint,
            _window: Duration,
            _threshold: u32,
        ) -> CatalogResult<CandidateStream<'_>> {
            Ok(futures::stream::iter(self.0.clone().into_iter().map(Ok)).boxed())
        }
    }

    fn classifier(
        catalog: &Arc<MemoryCatalog>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Classifier {
        Classifier::new(
            catalog.clone(),
            catalog.clone(),
            probe,
            ClassifierConfig::default(),
        )
    }

    fn suspicious(catalog: &MemoryCatalog, name: &str, endpoint: &str, reports: u32) {
        catalog.add_replica(&id(name), endpoint, ReplicaState::Available);
        catalog.report_suspicious_times(&id(name), endpoint, reports);
    }

    #[tokio::test]
    async fn test_escalate_only_with_available_copy() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        suspicious(&catalog, "r1", "X", 11);
        suspicious(&catalog, "r2", "X", 11);
        catalog.add_replica(&id("r1"), "Y", ReplicaState::Available);
        catalog.add_replica(&id("r2"), "Y", ReplicaState::Unavailable);

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        assert_eq!(result.outcomes.len(), 1);
        let decisions = &result.outcomes[0].decisions;
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].identity(), &id("r1"));
        assert_eq!(decisions[0].action, Action::Escalate);
        assert_eq!(decisions[0].reason, DecisionReason::AvailableElsewhere);
        assert_eq!(decisions[1].action, Action::Ignore);
        assert_eq!(decisions[1].reason, DecisionReason::NoSurvivingCopy);
    }

    #[tokio::test]
    async fn test_quarantine_short_circuits_probe() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        for i in 0..6 {
            let name = format!("f{i}");
            suspicious(&catalog, &name, "X", 11);
            catalog.add_replica(&id(&name), "Y", ReplicaState::Available);
        }

        let probe = Arc::new(CountingProbe {
            inner: catalog.clone(),
            calls: AtomicUsize::new(0),
        });
        let c = classifier(&catalog, probe.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        let outcome = &result.outcomes[0];
        assert!(outcome.quarantined());
        assert_eq!(outcome.count(Action::Quarantine), 6);
        assert!(outcome
            .decisions
            .iter()
            .all(|d| d.reason == DecisionReason::EndpointFaultSuspected));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_threshold_boundary_is_not_quarantine() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        for i in 0..5 {
            suspicious(&catalog, &format!("f{i}"), "X", 10);
        }

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        let outcome = &result.outcomes[0];
        assert_eq!(outcome.candidate_count, 5);
        assert!(!outcome.quarantined());
        assert_eq!(outcome.count(Action::Quarantine), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_abstains() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        suspicious(&catalog, "r1", "X", 11);
        catalog.add_replica(&id("r1"), "Y", ReplicaState::Available);
        catalog.fail_probe_for(&id("r1"));

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        let decision = &result.outcomes[0].decisions[0];
        assert_eq!(decision.action, Action::Ignore);
        assert_eq!(decision.reason, DecisionReason::ProbeFailed);
    }

    #[tokio::test]
    async fn test_query_failure_isolated_to_endpoint() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        catalog.add_endpoint(TENANT, "Y");
        suspicious(&catalog, "r1", "X", 11);
        suspicious(&catalog, "r2", "Y", 11);
        catalog.add_replica(&id("r2"), "Z", ReplicaState::Available);
        catalog.fail_queries_for("X");

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].endpoint, Some(Endpoint::new("X")));
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].endpoint, Endpoint::new("Y"));
        assert_eq!(result.outcomes[0].decisions[0].action, Action::Escalate);
    }

    #[tokio::test]
    async fn test_interrupted_candidate_stream_aborts_endpoint() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        for name in ["a", "b"] {
            suspicious(&catalog, name, "X", 11);
            catalog.add_replica(&id(name), "Y", ReplicaState::Available);
        }
        catalog.interrupt_queries_for("X", 1);

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        // A partial candidate list must not be classified
        assert!(result.outcomes.is_empty());
        assert_eq!(result.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_excluded_endpoint_never_queried() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "Z");
        suspicious(&catalog, "r1", "Z", 11);

        let policy = Policy::parse(
            "[[endpoint]]\npattern = \"Z\"\nexcluded = true\n",
            DocumentFormat::Toml,
            Path::new("policy.toml"),
            defaults(),
        )
        .unwrap();

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &policy).await;

        assert!(result.outcomes.is_empty());
        assert_eq!(result.excluded, vec![Endpoint::new("Z")]);
        assert_eq!(catalog.query_count(), 0);
    }

    #[tokio::test]
    async fn test_ignore_rule_skips_probe() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        catalog.add_replica(&ReplicaIdentity::new("user.jdoe", "job.log"), "X", ReplicaState::Available);
        catalog.report_suspicious_times(&ReplicaIdentity::new("user.jdoe", "job.log"), "X", 11);
        catalog.add_replica(&ReplicaIdentity::new("user.jdoe", "job.log"), "Y", ReplicaState::Available);

        let policy = Policy::parse(
            "[[replica_rule]]\nscope = \"user.*\"\naction = \"ignore\"\n",
            DocumentFormat::Toml,
            Path::new("policy.toml"),
            defaults(),
        )
        .unwrap();

        let probe = Arc::new(CountingProbe {
            inner: catalog.clone(),
            calls: AtomicUsize::new(0),
        });
        let c = classifier(&catalog, probe.clone());
        let result = c.classify_tenant(TENANT, &policy).await;

        let decision = &result.outcomes[0].decisions[0];
        assert_eq!(decision.action, Action::Ignore);
        assert_eq!(decision.reason, DecisionReason::IgnoreRule);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_policy_override_thresholds() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "BIG-DISK");
        for i in 0..4 {
            suspicious(&catalog, &format!("f{i}"), "BIG-DISK", 3);
        }

        let policy = Policy::parse(
            "[[endpoint]]\npattern = \"BIG-*\"\nquarantine_threshold = 3\nreport_threshold = 2\n",
            DocumentFormat::Toml,
            Path::new("policy.toml"),
            defaults(),
        )
        .unwrap();

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &policy).await;

        let outcome = &result.outcomes[0];
        assert_eq!(outcome.policy.report_threshold, 2);
        assert_eq!(outcome.candidate_count, 4);
        assert_eq!(outcome.count(Action::Quarantine), 4);
    }

    #[tokio::test]
    async fn test_parallel_classification_matches_sequential() {
        let catalog = Arc::new(MemoryCatalog::new());
        for e in ["A", "B", "C", "D"] {
            catalog.add_endpoint(TENANT, e);
            for i in 0..3 {
                let name = format!("{e}{i}");
                suspicious(&catalog, &name, e, 11);
                if i % 2 == 0 {
                    catalog.add_replica(&id(&name), "ELSEWHERE", ReplicaState::Available);
                }
            }
        }

        let sequential = classifier(&catalog, catalog.clone());
        let parallel = Classifier::new(
            catalog.clone(),
            catalog.clone(),
            catalog.clone(),
            ClassifierConfig {
                max_parallel_endpoints: 4,
                ..Default::default()
            },
        );

        let policy = Policy::empty(defaults());
        let a = sequential.classify_tenant(TENANT, &policy).await;
        let b = parallel.classify_tenant(TENANT, &policy).await;

        let flatten = |t: &TenantClassification| -> Vec<Decision> {
            t.outcomes.iter().flat_map(|o| o.decisions.clone()).collect()
        };
        assert_eq!(flatten(&a), flatten(&b));
        assert_eq!(flatten(&a).len(), 12);
    }

    #[tokio::test]
    async fn test_candidates_sorted_regardless_of_query_order() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        let now = chrono::Utc::now();
        let record = |name: &str| SuspiciousReplicaRecord {
            identity: id(name),
            endpoint: Endpoint::new("X"),
            report_count: 11,
            first_reported_at: now,
            last_reported_at: now,
        };

        let c = Classifier::new(
            catalog.clone(),
            Arc::new(FixedQuery(vec![record("c"), record("a"), record("b")])),
            catalog.clone(),
            ClassifierConfig::default(),
        );
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        let names: Vec<&str> = result.outcomes[0]
            .decisions
            .iter()
            .map(|d| d.identity().name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_listing_failure_recorded_for_tenant() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_endpoint(TENANT, "X");
        catalog.take_listing_down();

        let c = classifier(&catalog, catalog.clone());
        let result = c.classify_tenant(TENANT, &Policy::empty(defaults())).await;

        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].endpoint.is_none());
    }
}
