//! Error types for the recoverer core

use crate::types::{Endpoint, ReplicaIdentity};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for catalog operations
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// A single problem found while validating a policy document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyIssue {
    /// Table the entry came from (`endpoint` or `replica_rule`)
    pub section: &'static str,

    /// Zero-based index of the entry in its section
    pub index: usize,

    /// Pattern of the offending entry, as written
    pub pattern: String,

    /// Offending field, if the issue is field-specific
    pub field: Option<&'static str>,

    pub message: String,
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] (pattern {:?})", self.section, self.index, self.pattern)?;
        if let Some(field) = self.field {
            write!(f, " field `{}`", field)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Policy document failures. Always fatal at startup.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Document could not be read
    #[error("cannot read policy document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Document is not well-formed TOML/JSON or does not fit the schema
    #[error("malformed policy document {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Document parsed but failed validation
    #[error("invalid policy document {path}: {}", format_issues(.issues))]
    Invalid {
        path: PathBuf,
        issues: Vec<PolicyIssue>,
    },
}

impl PolicyError {
    /// Every validation issue, empty for I/O and parse failures
    pub fn issues(&self) -> &[PolicyIssue] {
        match self {
            PolicyError::Invalid { issues, .. } => issues,
            _ => &[],
        }
    }
}

fn format_issues(issues: &[PolicyIssue]) -> String {
    let lines: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
    format!("{} issue(s): {}", issues.len(), lines.join("; "))
}

/// Failures talking to the external replica catalog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Transient connectivity or query failure
    #[error("catalog unavailable during {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    /// The replica does not exist on that endpoint
    #[error("replica {identity} not found on {endpoint}")]
    NotFound {
        identity: ReplicaIdentity,
        endpoint: Endpoint,
    },
}

impl CatalogError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        CatalogError::Unavailable {
            operation,
            message: message.into(),
        }
    }

    /// Whether the next scheduled pass may succeed where this one failed
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Unavailable { .. })
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CatalogError {
    fn from(e: sqlx::Error) -> Self {
        CatalogError::unavailable("sqlite", e.to_string())
    }
}
