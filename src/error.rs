/*!
 * Error types for the recoverer daemon
 */

use recoverer_core::{CatalogError, PolicyError};
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, RecovererError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug)]
pub enum RecovererError {
    /// Invalid configuration file or flags
    Config(String),

    /// Policy document missing, malformed or invalid
    Policy(PolicyError),

    /// Catalog could not be opened or enumerated at startup
    Catalog(CatalogError),

    /// I/O error
    Io(io::Error),

    /// A run-once pass finished but skipped work because of catalog errors
    PassIncomplete {
        endpoints_failed: usize,
        actions_failed: usize,
    },
}

impl RecovererError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RecovererError::Config(_) | RecovererError::Policy(_) | RecovererError::Io(_) => {
                EXIT_FATAL
            }
            RecovererError::Catalog(_) => EXIT_FATAL,
            RecovererError::PassIncomplete { .. } => EXIT_PARTIAL,
        }
    }
}

impl fmt::Display for RecovererError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecovererError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RecovererError::Policy(err) => write!(f, "Policy error: {}", err),
            RecovererError::Catalog(err) => write!(f, "Catalog error: {}", err),
            RecovererError::Io(err) => write!(f, "I/O error: {}", err),
            RecovererError::PassIncomplete {
                endpoints_failed,
                actions_failed,
            } => write!(
                f,
                "Pass incomplete: {} endpoint(s) and {} action(s) skipped",
                endpoints_failed, actions_failed
            ),
        }
    }
}

impl std::error::Error for RecovererError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecovererError::Policy(err) => Some(err),
            RecovererError::Catalog(err) => Some(err),
            RecovererError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RecovererError {
    fn from(err: io::Error) -> Self {
        RecovererError::Io(err)
    }
}

impl From<PolicyError> for RecovererError {
    fn from(err: PolicyError) -> Self {
        RecovererError::Policy(err)
    }
}

impl From<CatalogError> for RecovererError {
    fn from(err: CatalogError) -> Self {
        RecovererError::Catalog(err)
    }
}
