//! In-memory catalog backend
//!
//! Holds endpoints, replica states and raw suspicion reports in process.
//! Used by the test suites. Faults can be injected per endpoint or per
//! replica to exercise the error paths.

use crate::catalog::{
    window_start, AvailabilityProbe, CandidateStream, EndpointDirectory, ReplicaStateWriter,
    SuspicionQuery, TenantDirectory, TransitionOutcome,
};
use crate::error::{CatalogError, CatalogResult};
use crate::types::{Endpoint, ReplicaIdentity, ReplicaState, SuspiciousReplicaRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
struct Report {
    identity: ReplicaIdentity,
    endpoint: Endpoint,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: BTreeMap<Endpoint, String>,
    extra_tenants: BTreeSet<String>,
    replicas: BTreeMap<(ReplicaIdentity, Endpoint), ReplicaState>,
    reports: Vec<Report>,
    failing_queries: HashSet<Endpoint>,
    interrupted_queries: HashMap<Endpoint, usize>,
    failing_probes: HashSet<ReplicaIdentity>,
    failing_writes: HashSet<ReplicaIdentity>,
    listing_down: bool,
}

/// In-process replica catalog
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
    mutations: AtomicU64,
    queries: AtomicU64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint as belonging to a tenant
    pub fn add_endpoint(&self, tenant: &str, endpoint: &str) {
        self.write()
            .endpoints
            .insert(Endpoint::new(endpoint), tenant.to_string());
    }

    /// Register a tenant that owns no endpoint
    pub fn add_tenant(&self, tenant: &str) {
        self.write().extra_tenants.insert(tenant.to_string());
    }

    /// Place a replica on an endpoint in the given state
    pub fn add_replica(&self, identity: &ReplicaIdentity, endpoint: &str, state: ReplicaState) {
        self.write()
            .replicas
            .insert((identity.clone(), Endpoint::new(endpoint)), state);
    }

    /// Record one suspicion report
    ///
    /// An AVAILABLE replica becomes SUSPICIOUS; replicas in any other state
    /// keep it, but the report is still counted.
    pub fn report_suspicious(&self, identity: &ReplicaIdentity, endpoint: &str, at: DateTime<Utc>) {
        let endpoint = Endpoint::new(endpoint);
        let mut inner = self.write();

        if let Some(state) = inner.replicas.get_mut(&(identity.clone(), endpoint.clone())) {
            if *state == ReplicaState::Available {
                *state = ReplicaState::Suspicious;
            }
        }

        inner.reports.push(Report {
            identity: identity.clone(),
            endpoint,
            at,
        });
    }

    /// Record `count` reports spread over the last hours
    pub fn report_suspicious_times(&self, identity: &ReplicaIdentity, endpoint: &str, count: u32) {
        let now = Utc::now();
        for i in 0..count {
            self.report_suspicious(identity, endpoint, now - Duration::minutes(i64::from(i) + 1));
        }
    }

    pub fn state_of(&self, identity: &ReplicaIdentity, endpoint: &str) -> Option<ReplicaState> {
        self.read()
            .replicas
            .get(&(identity.clone(), Endpoint::new(endpoint)))
            .copied()
    }

    /// Number of replica state changes applied so far
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of suspicion queries served so far
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    /// Make suspicion queries for this endpoint fail outright
    pub fn fail_queries_for(&self, endpoint: &str) {
        self.write().failing_queries.insert(Endpoint::new(endpoint));
    }

    /// Make the candidate stream for this endpoint fail after `after` records
    pub fn interrupt_queries_for(&self, endpoint: &str, after: usize) {
        self.write()
            .interrupted_queries
            .insert(Endpoint::new(endpoint), after);
    }

    /// Make availability probes for this replica fail
    pub fn fail_probe_for(&self, identity: &ReplicaIdentity) {
        self.write().failing_probes.insert(identity.clone());
    }

    /// Make state transitions for this replica fail
    pub fn fail_writes_for(&self, identity: &ReplicaIdentity) {
        self.write().failing_writes.insert(identity.clone());
    }

    /// Make tenant and endpoint listing fail
    pub fn take_listing_down(&self) {
        self.write().listing_down = true;
    }

    pub fn clear_faults(&self) {
        let mut inner = self.write();
        inner.failing_queries.clear();
        inner.interrupted_queries.clear();
        inner.failing_probes.clear();
        inner.failing_writes.clear();
        inner.listing_down = false;
    }
}

#[async_trait]
impl TenantDirectory for MemoryCatalog {
    async fn list_tenants(&self) -> CatalogResult<Vec<String>> {
        let inner = self.read();
        if inner.listing_down {
            return Err(CatalogError::unavailable("list_tenants", "listing down"));
        }

        let tenants: BTreeSet<String> = inner
            .endpoints
            .values()
            .cloned()
            .chain(inner.extra_tenants.iter().cloned())
            .collect();
        Ok(tenants.into_iter().collect())
    }
}

#[async_trait]
impl EndpointDirectory for MemoryCatalog {
    async fn list_endpoints(&self, tenant: &str, pattern: &str) -> CatalogResult<Vec<Endpoint>> {
        let matcher = Pattern::new(pattern).map_err(|e| {
            CatalogError::unavailable("list_endpoints", format!("invalid pattern {pattern:?}: {e}"))
        })?;

        let inner = self.read();
        if inner.listing_down {
            return Err(CatalogError::unavailable("list_endpoints", "listing down"));
        }

        Ok(inner
            .endpoints
            .iter()
            .filter(|(endpoint, owner)| owner.as_str() == tenant && matcher.matches(endpoint.as_str()))
            .map(|(endpoint, _)| endpoint.clone())
            .collect())
    }
}

#[async_trait]
impl SuspicionQuery for MemoryCatalog {
    async fn find(
        &self,
        tenant: &str,
        endpoint: &Endpoint,
        window: Duration,
        threshold: u32,
    ) -> CatalogResult<CandidateStream<'_>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let inner = self.read();

        if inner.failing_queries.contains(endpoint) {
            return Err(CatalogError::unavailable(
                "find",
                format!("{endpoint} unreachable"),
            ));
        }

        if inner.endpoints.get(endpoint).map(String::as_str) != Some(tenant) {
            return Ok(stream::empty().boxed());
        }

        let cutoff = window_start(window)?;
        let mut grouped: BTreeMap<&ReplicaIdentity, (u32, DateTime<Utc>, DateTime<Utc>)> =
            BTreeMap::new();

        for report in inner
            .reports
            .iter()
            .filter(|r| &r.endpoint == endpoint && r.at >= cutoff)
        {
            let entry = grouped
                .entry(&report.identity)
                .or_insert((0, report.at, report.at));
            entry.0 += 1;
            entry.1 = entry.1.min(report.at);
            entry.2 = entry.2.max(report.at);
        }

        let records: Vec<SuspiciousReplicaRecord> = grouped
            .into_iter()
            .filter(|(identity, (count, _, _))| {
                *count >= threshold
                    && inner
                        .replicas
                        .get(&((*identity).clone(), endpoint.clone()))
                        == Some(&ReplicaState::Suspicious)
            })
            .map(|(identity, (count, first, last))| SuspiciousReplicaRecord {
                identity: identity.clone(),
                endpoint: endpoint.clone(),
                report_count: count,
                first_reported_at: first,
                last_reported_at: last,
            })
            .collect();

        let items: Vec<CatalogResult<SuspiciousReplicaRecord>> =
            match inner.interrupted_queries.get(endpoint) {
                Some(&after) => records
                    .into_iter()
                    .take(after)
                    .map(Ok)
                    .chain(std::iter::once(Err(CatalogError::unavailable(
                        "find",
                        format!("connection to catalog lost while reading {endpoint}"),
                    ))))
                    .collect(),
                None => records.into_iter().map(Ok).collect(),
            };

        Ok(stream::iter(items).boxed())
    }
}

#[async_trait]
impl AvailabilityProbe for MemoryCatalog {
    async fn has_available_elsewhere(
        &self,
        identity: &ReplicaIdentity,
        excluding: &Endpoint,
    ) -> CatalogResult<bool> {
        let inner = self.read();
        if inner.failing_probes.contains(identity) {
            return Err(CatalogError::unavailable(
                "has_available_elsewhere",
                format!("probe for {identity} timed out"),
            ));
        }

        Ok(inner.replicas.iter().any(|((id, endpoint), state)| {
            id == identity && endpoint != excluding && *state == ReplicaState::Available
        }))
    }
}

#[async_trait]
impl ReplicaStateWriter for MemoryCatalog {
    async fn transition(
        &self,
        identity: &ReplicaIdentity,
        endpoint: &Endpoint,
        from: ReplicaState,
        to: ReplicaState,
    ) -> CatalogResult<TransitionOutcome> {
        let mut inner = self.write();
        if inner.failing_writes.contains(identity) {
            return Err(CatalogError::unavailable(
                "transition",
                format!("update of {identity} on {endpoint} rejected"),
            ));
        }

        let state = inner
            .replicas
            .get_mut(&(identity.clone(), endpoint.clone()))
            .ok_or_else(|| CatalogError::NotFound {
                identity: identity.clone(),
                endpoint: endpoint.clone(),
            })?;

        if *state == to {
            Ok(TransitionOutcome::AlreadyInState)
        } else if *state == from {
            *state = to;
            self.mutations.fetch_add(1, Ordering::SeqCst);
            Ok(TransitionOutcome::Applied)
        } else {
            Ok(TransitionOutcome::StateChanged(*state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn id(name: &str) -> ReplicaIdentity {
        ReplicaIdentity::new("data18", name)
    }

    async fn collect(
        catalog: &MemoryCatalog,
        tenant: &str,
        endpoint: &str,
        threshold: u32,
    ) -> CatalogResult<Vec<SuspiciousReplicaRecord>> {
        catalog
            .find(tenant, &Endpoint::new(endpoint), Duration::days(3), threshold)
            .await?
            .try_collect()
            .await
    }

    #[tokio::test]
    async fn test_find_counts_within_window() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("def", "X");
        catalog.add_replica(&id("f1"), "X", ReplicaState::Available);
        catalog.report_suspicious_times(&id("f1"), "X", 3);
        // Old report outside the window does not count
        catalog.report_suspicious(&id("f1"), "X", Utc::now() - Duration::days(10));

        let records = collect(&catalog, "def", "X", 3).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].report_count, 3);
        assert!(records[0].first_reported_at <= records[0].last_reported_at);

        assert!(collect(&catalog, "def", "X", 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_with_out_of_range_window_is_an_error() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("def", "X");
        catalog.add_replica(&id("f1"), "X", ReplicaState::Available);
        catalog.report_suspicious_times(&id("f1"), "X", 3);

        let result = catalog
            .find("def", &Endpoint::new("X"), Duration::days(200_000_000), 1)
            .await;
        assert!(matches!(result, Err(CatalogError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_find_only_suspicious_state() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("def", "X");
        catalog.add_replica(&id("bad"), "X", ReplicaState::Bad);
        catalog.add_replica(&id("tmp"), "X", ReplicaState::TemporaryUnavailable);
        catalog.add_replica(&id("sus"), "X", ReplicaState::Available);
        for name in ["bad", "tmp", "sus"] {
            catalog.report_suspicious_times(&id(name), "X", 2);
        }

        let records = collect(&catalog, "def", "X", 1).await.unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.identity.name.as_str()).collect();
        assert_eq!(names, vec!["sus"]);
    }

    #[tokio::test]
    async fn test_find_is_scoped_to_tenant() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("atlas", "X");
        catalog.add_replica(&id("f"), "X", ReplicaState::Available);
        catalog.report_suspicious_times(&id("f"), "X", 2);

        assert!(collect(&catalog, "cms", "X", 1).await.unwrap().is_empty());
        assert_eq!(collect(&catalog, "atlas", "X", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_stream_surfaces_error() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("def", "X");
        for name in ["a", "b", "c"] {
            catalog.add_replica(&id(name), "X", ReplicaState::Available);
            catalog.report_suspicious_times(&id(name), "X", 1);
        }
        catalog.interrupt_queries_for("X", 1);

        assert!(collect(&catalog, "def", "X", 1).await.is_err());
        catalog.clear_faults();
        assert_eq!(collect(&catalog, "def", "X", 1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_probe_ignores_non_available_states() {
        let catalog = MemoryCatalog::new();
        let f = id("f");
        catalog.add_replica(&f, "X", ReplicaState::Suspicious);
        catalog.add_replica(&f, "Y", ReplicaState::Unavailable);
        catalog.add_replica(&f, "Z", ReplicaState::Bad);
        catalog.add_replica(&f, "W", ReplicaState::TemporaryUnavailable);

        let x = Endpoint::new("X");
        assert!(!catalog.has_available_elsewhere(&f, &x).await.unwrap());

        catalog.add_replica(&f, "V", ReplicaState::Available);
        assert!(catalog.has_available_elsewhere(&f, &x).await.unwrap());
        // The excluded endpoint itself never counts
        assert!(!catalog
            .has_available_elsewhere(&f, &Endpoint::new("V"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_batch_probe_matches_single_probe() {
        let catalog = MemoryCatalog::new();
        catalog.add_replica(&id("a"), "Y", ReplicaState::Available);
        catalog.add_replica(&id("b"), "Y", ReplicaState::Unavailable);
        catalog.fail_probe_for(&id("c"));

        let x = Endpoint::new("X");
        let answers = catalog
            .available_elsewhere(&[id("a"), id("b"), id("c")], &x)
            .await;

        assert_eq!(answers[&id("a")], Ok(true));
        assert_eq!(answers[&id("b")], Ok(false));
        assert!(answers[&id("c")].is_err());
    }

    #[tokio::test]
    async fn test_transition_is_idempotent() {
        let catalog = MemoryCatalog::new();
        let f = id("f");
        let x = Endpoint::new("X");
        catalog.add_replica(&f, "X", ReplicaState::Suspicious);

        let first = catalog
            .transition(&f, &x, ReplicaState::Suspicious, ReplicaState::Bad)
            .await
            .unwrap();
        let second = catalog
            .transition(&f, &x, ReplicaState::Suspicious, ReplicaState::Bad)
            .await
            .unwrap();

        assert_eq!(first, TransitionOutcome::Applied);
        assert_eq!(second, TransitionOutcome::AlreadyInState);
        assert_eq!(catalog.mutation_count(), 1);

        let other = catalog
            .transition(
                &f,
                &x,
                ReplicaState::Suspicious,
                ReplicaState::TemporaryUnavailable,
            )
            .await
            .unwrap();
        assert_eq!(other, TransitionOutcome::StateChanged(ReplicaState::Bad));
        assert_eq!(catalog.state_of(&f, "X"), Some(ReplicaState::Bad));
    }

    #[tokio::test]
    async fn test_transition_unknown_replica() {
        let catalog = MemoryCatalog::new();
        let result = catalog
            .transition(
                &id("ghost"),
                &Endpoint::new("X"),
                ReplicaState::Suspicious,
                ReplicaState::Bad,
            )
            .await;
        assert!(matches!(result, Err(CatalogError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_listing() {
        let catalog = MemoryCatalog::new();
        catalog.add_endpoint("atlas", "CERN-PROD");
        catalog.add_endpoint("atlas", "BNL-OSG2");
        catalog.add_endpoint("cms", "T1_US_FNAL");
        catalog.add_tenant("lhcb");

        assert_eq!(
            catalog.list_tenants().await.unwrap(),
            vec!["atlas", "cms", "lhcb"]
        );
        assert_eq!(
            catalog.list_endpoints("atlas", "*").await.unwrap(),
            vec![Endpoint::new("BNL-OSG2"), Endpoint::new("CERN-PROD")]
        );
        assert_eq!(
            catalog.list_endpoints("atlas", "CERN-*").await.unwrap(),
            vec![Endpoint::new("CERN-PROD")]
        );

        catalog.take_listing_down();
        assert!(catalog.list_tenants().await.is_err());
    }
}
