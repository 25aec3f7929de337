//! Recoverer Core: suspicious replica decision engine
//!
//! Replicas that keep getting reported as suspicious on a storage endpoint
//! are either escalated to BAD, so that an external recovery engine replaces
//! them from a surviving copy, or quarantined when the whole endpoint looks
//! unhealthy. The engine never owns replica state; every read and write goes
//! through the [`catalog`] traits.
//!
//! # Architecture: one pass
//!
//! ```text
//! ┌─────────────┐
//! │  Select     │──> Tenants x endpoints matching the pattern, minus excluded
//! └──────┬──────┘
//!        │
//!        v
//! ┌─────────────┐
//! │  Count      │──> Replicas with >= report_threshold reports in the window
//! └──────┬──────┘
//!        │
//!        v
//! ┌─────────────┐
//! │  Classify   │──> Too many? Quarantine all. Else copy elsewhere? Escalate.
//! └──────┬──────┘
//!        │
//!        v
//! ┌─────────────┐
//! │  Apply      │──> Dry-run log, or idempotent catalog transition
//! └──────┬──────┘
//!        │
//!        └────> Sleep, then loop (unless run-once or stopped)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use recoverer_core::backends::MemoryCatalog;
//! use recoverer_core::{ClassifierConfig, PolicyDefaults, PolicyStore, RunOptions, Scheduler};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let catalog = Arc::new(MemoryCatalog::new());
//! let policy = Arc::new(PolicyStore::load(None, PolicyDefaults::default())?);
//!
//! let scheduler = Scheduler::with_catalog(catalog, policy, ClassifierConfig::default());
//! let options = RunOptions {
//!     run_once: true,
//!     ..Default::default()
//! };
//! let history = scheduler
//!     .run(options, &["def".to_string()], CancellationToken::new())
//!     .await;
//! println!("{} pass(es)", history.passes);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod catalog;
pub mod classifier;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod test_logs;

pub use catalog::{
    AvailabilityProbe, Catalog, EndpointDirectory, ReplicaStateWriter, SuspicionQuery,
    TenantDirectory, TransitionOutcome,
};
pub use classifier::{
    Classifier, ClassifierConfig, EndpointFailure, EndpointOutcome, TenantClassification,
};
pub use error::{CatalogError, CatalogResult, PolicyError, PolicyIssue};
pub use executor::{ActionExecutor, ApplyOutcome, ApplyReport};
pub use metrics::{PassStats, PassStatsBuilder};
pub use policy::{Policy, PolicyDefaults, PolicyStore, ResolvedPolicy};
pub use scheduler::{resolve_tenants, PassHistory, PassReport, RunOptions, Scheduler, SchedulerState};
pub use types::{
    Action, Decision, DecisionReason, Endpoint, ReplicaIdentity, ReplicaState,
    SuspiciousReplicaRecord,
};
