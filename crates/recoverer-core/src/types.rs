//! Catalog data model as seen by the recoverer
//!
//! Records are produced by the catalog and are read-only here. Decisions are
//! produced and consumed within a single pass and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Globally unique logical file identifier (scope + name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaIdentity {
    /// Namespace the file lives in
    pub scope: String,

    /// File name within the scope
    pub name: String,
}

impl ReplicaIdentity {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// A storage endpoint (storage element) name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Replica state as owned by the catalog
///
/// The recoverer only ever requests `Suspicious -> Bad` and
/// `Suspicious -> TemporaryUnavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Available,
    Unavailable,
    Bad,
    TemporaryUnavailable,
    Suspicious,
}

impl ReplicaState {
    /// Single-letter code used on the catalog boundary
    pub fn code(&self) -> &'static str {
        match self {
            ReplicaState::Available => "A",
            ReplicaState::Unavailable => "U",
            ReplicaState::Bad => "B",
            ReplicaState::TemporaryUnavailable => "T",
            ReplicaState::Suspicious => "S",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaState::Available => "AVAILABLE",
            ReplicaState::Unavailable => "UNAVAILABLE",
            ReplicaState::Bad => "BAD",
            ReplicaState::TemporaryUnavailable => "TEMPORARY_UNAVAILABLE",
            ReplicaState::Suspicious => "SUSPICIOUS",
        };
        f.write_str(s)
    }
}

impl FromStr for ReplicaState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "AVAILABLE" => Ok(ReplicaState::Available),
            "U" | "UNAVAILABLE" => Ok(ReplicaState::Unavailable),
            "B" | "BAD" => Ok(ReplicaState::Bad),
            "T" | "TEMPORARY_UNAVAILABLE" => Ok(ReplicaState::TemporaryUnavailable),
            "S" | "SUSPICIOUS" => Ok(ReplicaState::Suspicious),
            other => Err(format!("unknown replica state: {other}")),
        }
    }
}

/// Aggregated suspicion reports for one replica on one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousReplicaRecord {
    pub identity: ReplicaIdentity,
    pub endpoint: Endpoint,

    /// Number of reports within the trailing window
    pub report_count: u32,

    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
}

/// What the classifier wants done with a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Promote SUSPICIOUS -> BAD, handing the file to recovery
    Escalate,

    /// Demote SUSPICIOUS -> TEMPORARY_UNAVAILABLE, the endpoint is suspect
    Quarantine,

    /// Leave the replica SUSPICIOUS and look again next pass
    Ignore,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Escalate => "escalate",
            Action::Quarantine => "quarantine",
            Action::Ignore => "ignore",
        }
    }

    /// Target state for catalog-mutating actions
    pub fn target_state(&self) -> Option<ReplicaState> {
        match self {
            Action::Escalate => Some(ReplicaState::Bad),
            Action::Quarantine => Some(ReplicaState::TemporaryUnavailable),
            Action::Ignore => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    EndpointFaultSuspected,
    AvailableElsewhere,
    NoSurvivingCopy,
    IgnoreRule,
    ProbeFailed,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::EndpointFaultSuspected => "endpoint-level fault suspected",
            DecisionReason::AvailableElsewhere => "confirmed available elsewhere",
            DecisionReason::NoSurvivingCopy => "no surviving copy found",
            DecisionReason::IgnoreRule => "matched ignore rule",
            DecisionReason::ProbeFailed => "availability probe failed",
        };
        f.write_str(s)
    }
}

/// One classification result for one candidate replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub record: SuspiciousReplicaRecord,
    pub action: Action,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn new(record: SuspiciousReplicaRecord, action: Action, reason: DecisionReason) -> Self {
        Self {
            record,
            action,
            reason,
        }
    }

    pub fn identity(&self) -> &ReplicaIdentity {
        &self.record.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.record.endpoint
    }
}
