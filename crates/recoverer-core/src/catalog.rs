//! Boundary to the external replica catalog
//!
//! The recoverer never owns replica state. Everything it reads or writes goes
//! through these traits, kept separate so that each query can be mocked on
//! its own.

use crate::error::{CatalogError, CatalogResult};
use crate::types::{Endpoint, ReplicaIdentity, ReplicaState, SuspiciousReplicaRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;

/// Lazy stream of candidates for one endpoint
pub type CandidateStream<'a> = BoxStream<'a, CatalogResult<SuspiciousReplicaRecord>>;

/// Oldest report time still inside `window`, counted back from now
///
/// A window reaching past the representable date range is an error rather
/// than a panic.
pub fn window_start(window: Duration) -> CatalogResult<DateTime<Utc>> {
    Utc::now().checked_sub_signed(window).ok_or_else(|| {
        CatalogError::unavailable(
            "find",
            format!("report window of {} days is out of range", window.num_days()),
        )
    })
}

/// Enumerates the tenants (VOs) known to the catalog
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenants(&self) -> CatalogResult<Vec<String>>;
}

/// Enumerates endpoints of a tenant matching a selection pattern
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Endpoints are returned sorted and without duplicates
    async fn list_endpoints(&self, tenant: &str, pattern: &str) -> CatalogResult<Vec<Endpoint>>;
}

/// Aggregated suspicion reports
#[async_trait]
pub trait SuspicionQuery: Send + Sync {
    /// Replicas on `endpoint` still in SUSPICIOUS state whose report count
    /// within the trailing `window` is at least `threshold`
    ///
    /// Calling again restarts the sequence from a fresh read.
    async fn find(
        &self,
        tenant: &str,
        endpoint: &Endpoint,
        window: Duration,
        threshold: u32,
    ) -> CatalogResult<CandidateStream<'_>>;
}

/// Is there a surviving copy of a replica somewhere else?
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    /// True only if some endpoint other than `excluding` holds `identity` in
    /// state AVAILABLE
    async fn has_available_elsewhere(
        &self,
        identity: &ReplicaIdentity,
        excluding: &Endpoint,
    ) -> CatalogResult<bool>;

    /// Batch form of [`has_available_elsewhere`](Self::has_available_elsewhere)
    ///
    /// Backends may answer with a single join; the answer per identity must
    /// be the same as the per-identity call, and a failure stays attached to
    /// the identity it concerns.
    async fn available_elsewhere(
        &self,
        identities: &[ReplicaIdentity],
        excluding: &Endpoint,
    ) -> HashMap<ReplicaIdentity, CatalogResult<bool>> {
        let mut answers = HashMap::with_capacity(identities.len());
        for identity in identities {
            let answer = self.has_available_elsewhere(identity, excluding).await;
            answers.insert(identity.clone(), answer);
        }
        answers
    }
}

/// Result of a state transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The replica moved from `from` to `to`
    Applied,

    /// The replica was already in the target state; nothing changed
    AlreadyInState,

    /// The replica was in neither state and was left untouched
    StateChanged(ReplicaState),
}

/// Requests replica state transitions
#[async_trait]
pub trait ReplicaStateWriter: Send + Sync {
    /// Move a replica from `from` to `to`, idempotently
    async fn transition(
        &self,
        identity: &ReplicaIdentity,
        endpoint: &Endpoint,
        from: ReplicaState,
        to: ReplicaState,
    ) -> CatalogResult<TransitionOutcome>;
}

/// Convenience bound for a backend that implements every catalog role
pub trait Catalog:
    TenantDirectory + EndpointDirectory + SuspicionQuery + AvailabilityProbe + ReplicaStateWriter
{
}

impl<T> Catalog for T where
    T: TenantDirectory
        + EndpointDirectory
        + SuspicionQuery
        + AvailabilityProbe
        + ReplicaStateWriter
{
}
