/*!
 * Recoverer - suspicious replica recovery daemon
 *
 * Periodically reviews replicas reported as suspicious on storage endpoints:
 * - Escalates a replica to BAD when another endpoint holds an AVAILABLE copy
 * - Quarantines every candidate of an endpoint that looks faulty as a whole
 * - Leaves everything else suspicious for the next pass
 *
 * The decision engine lives in `recoverer-core`; this crate adds
 * configuration, logging and the command-line daemon.
 */

pub mod app;
pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::{LogLevel, RecovererConfig};
pub use error::{RecovererError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
