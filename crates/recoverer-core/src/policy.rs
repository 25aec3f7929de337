//! Recoverer Policy Engine
//!
//! Loads the per-endpoint override document and resolves the thresholds that
//! apply to a given endpoint. Thresholds are safety-critical: a document that
//! fails validation is rejected as a whole, with every problem reported at
//! once, and nothing silently falls back to a default.
//!
//! # Document format
//!
//! TOML (or JSON when the file ends in `.json`):
//!
//! ```toml
//! [[endpoint]]
//! pattern = "CERN-*"
//! quarantine_threshold = 20
//! report_threshold = 4
//!
//! [[endpoint]]
//! pattern = "SCRATCH-DISK"
//! excluded = true
//!
//! [[replica_rule]]
//! scope = "user.*"
//! name = "*.log"
//! action = "ignore"
//! ```

use crate::error::{PolicyError, PolicyIssue};
use crate::types::ReplicaIdentity;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Global thresholds used when no endpoint override applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDefaults {
    /// Candidate count above which an endpoint is quarantined
    pub quarantine_threshold: u32,

    /// Minimum report count for a replica to become a candidate
    pub report_threshold: u32,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            quarantine_threshold: 5,
            report_threshold: 10,
        }
    }
}

/// Thresholds in force for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPolicy {
    pub quarantine_threshold: u32,
    pub report_threshold: u32,
    pub excluded: bool,

    /// Pattern of the override that matched, `None` when defaults apply
    pub matched_pattern: Option<String>,
}

/// Serialization format of a policy document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Toml,
    Json,
}

impl DocumentFormat {
    /// Pick the format from the file extension (`.json`, anything else is TOML)
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Toml,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    #[serde(default, rename = "endpoint")]
    endpoints: Vec<EndpointEntry>,

    #[serde(default, rename = "replica_rule")]
    replica_rules: Vec<ReplicaRuleEntry>,
}

// Thresholds are read as signed so that zero and negative values reach
// validation and show up in the issue report instead of a parse error.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointEntry {
    pattern: String,
    quarantine_threshold: Option<i64>,
    report_threshold: Option<i64>,
    #[serde(default)]
    excluded: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplicaRuleEntry {
    scope: String,
    #[serde(default = "match_all")]
    name: String,
    action: RuleAction,
}

fn match_all() -> String {
    "*".to_string()
}

/// What a replica rule does to matching candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Never escalate matching replicas, leave them suspicious
    Ignore,
}

/// A validated per-endpoint override
#[derive(Debug, Clone)]
pub struct EndpointOverride {
    pattern: String,
    matcher: Pattern,
    literal_len: usize,
    exact: bool,
    pub quarantine_threshold: Option<u32>,
    pub report_threshold: Option<u32>,
    pub excluded: bool,
}

impl EndpointOverride {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, endpoint: &str) -> bool {
        if self.exact {
            self.pattern == endpoint
        } else {
            self.matcher.matches(endpoint)
        }
    }

    // Exact patterns first, then more literal characters, then lexical order.
    fn more_specific_than(&self, other: &EndpointOverride) -> bool {
        (self.exact, self.literal_len, std::cmp::Reverse(&self.pattern))
            > (other.exact, other.literal_len, std::cmp::Reverse(&other.pattern))
    }
}

/// A validated replica rule
#[derive(Debug, Clone)]
pub struct ReplicaRule {
    scope: Pattern,
    name: Pattern,
    pub action: RuleAction,
}

impl ReplicaRule {
    fn matches(&self, identity: &ReplicaIdentity) -> bool {
        self.scope.matches(&identity.scope) && self.name.matches(&identity.name)
    }
}

/// An immutable, validated policy. One snapshot is used per pass.
#[derive(Debug, Clone)]
pub struct Policy {
    defaults: PolicyDefaults,
    endpoints: Vec<EndpointOverride>,
    replica_rules: Vec<ReplicaRule>,
}

impl Policy {
    /// A policy with no overrides: every endpoint gets the defaults
    pub fn empty(defaults: PolicyDefaults) -> Self {
        Self {
            defaults,
            endpoints: Vec::new(),
            replica_rules: Vec::new(),
        }
    }

    /// Read and validate a policy document
    pub fn load(path: &Path, defaults: PolicyDefaults) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, DocumentFormat::from_path(path), path, defaults)
    }

    /// Parse and validate a policy document already in memory
    ///
    /// `origin` is only used for error reporting.
    pub fn parse(
        text: &str,
        format: DocumentFormat,
        origin: &Path,
        defaults: PolicyDefaults,
    ) -> Result<Self, PolicyError> {
        let document: PolicyDocument = match format {
            DocumentFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
            DocumentFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
        }
        .map_err(|message| PolicyError::Parse {
            path: origin.to_path_buf(),
            message,
        })?;

        Self::from_document(document, origin, defaults)
    }

    fn from_document(
        document: PolicyDocument,
        origin: &Path,
        defaults: PolicyDefaults,
    ) -> Result<Self, PolicyError> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        let mut endpoints = Vec::with_capacity(document.endpoints.len());

        for (index, entry) in document.endpoints.into_iter().enumerate() {
            let issue = |field: Option<&'static str>, message: String| PolicyIssue {
                section: "endpoint",
                index,
                pattern: entry.pattern.clone(),
                field,
                message,
            };

            let pattern = entry.pattern.trim().to_string();
            let mut valid = true;

            if pattern.is_empty() {
                issues.push(issue(Some("pattern"), "must not be empty".to_string()));
                valid = false;
            } else if !seen.insert(pattern.clone()) {
                issues.push(issue(
                    Some("pattern"),
                    "duplicate pattern entry".to_string(),
                ));
                valid = false;
            }

            let matcher = match Pattern::new(&pattern) {
                Ok(m) => Some(m),
                Err(e) => {
                    if !pattern.is_empty() {
                        issues.push(issue(Some("pattern"), format!("invalid glob: {}", e)));
                    }
                    valid = false;
                    None
                }
            };

            let quarantine_threshold =
                match positive(entry.quarantine_threshold, "quarantine_threshold") {
                    Ok(v) => v,
                    Err((field, message)) => {
                        issues.push(issue(Some(field), message));
                        valid = false;
                        None
                    }
                };

            let report_threshold = match positive(entry.report_threshold, "report_threshold") {
                Ok(v) => v,
                Err((field, message)) => {
                    issues.push(issue(Some(field), message));
                    valid = false;
                    None
                }
            };

            if let (true, Some(matcher)) = (valid, matcher) {
                let (exact, literal_len) = literal_profile(&pattern);
                endpoints.push(EndpointOverride {
                    pattern,
                    matcher,
                    literal_len,
                    exact,
                    quarantine_threshold,
                    report_threshold,
                    excluded: entry.excluded,
                });
            }
        }

        let mut replica_rules = Vec::with_capacity(document.replica_rules.len());
        for (index, entry) in document.replica_rules.into_iter().enumerate() {
            let issue = |field: &'static str, message: String| PolicyIssue {
                section: "replica_rule",
                index,
                pattern: format!("{}:{}", entry.scope, entry.name),
                field: Some(field),
                message,
            };

            if entry.scope.trim().is_empty() {
                issues.push(issue("scope", "must not be empty".to_string()));
                continue;
            }

            let scope = Pattern::new(entry.scope.trim())
                .map_err(|e| issue("scope", format!("invalid glob: {}", e)));
            let name = Pattern::new(entry.name.trim())
                .map_err(|e| issue("name", format!("invalid glob: {}", e)));

            match (scope, name) {
                (Ok(scope), Ok(name)) => replica_rules.push(ReplicaRule {
                    scope,
                    name,
                    action: entry.action,
                }),
                (scope, name) => {
                    issues.extend(scope.err());
                    issues.extend(name.err());
                }
            }
        }

        if !issues.is_empty() {
            return Err(PolicyError::Invalid {
                path: origin.to_path_buf(),
                issues,
            });
        }

        Ok(Self {
            defaults,
            endpoints,
            replica_rules,
        })
    }

    pub fn defaults(&self) -> PolicyDefaults {
        self.defaults
    }

    pub fn endpoint_overrides(&self) -> &[EndpointOverride] {
        &self.endpoints
    }

    pub fn replica_rules(&self) -> &[ReplicaRule] {
        &self.replica_rules
    }

    /// Resolve the thresholds for an endpoint
    ///
    /// The most specific matching override wins; fields it leaves unset come
    /// from the global defaults.
    pub fn resolve(&self, endpoint: &str) -> ResolvedPolicy {
        let best = self
            .endpoints
            .iter()
            .filter(|o| o.matches(endpoint))
            .fold(None::<&EndpointOverride>, |best, candidate| match best {
                Some(b) if !candidate.more_specific_than(b) => Some(b),
                _ => Some(candidate),
            });

        match best {
            Some(o) => ResolvedPolicy {
                quarantine_threshold: o
                    .quarantine_threshold
                    .unwrap_or(self.defaults.quarantine_threshold),
                report_threshold: o.report_threshold.unwrap_or(self.defaults.report_threshold),
                excluded: o.excluded,
                matched_pattern: Some(o.pattern.clone()),
            },
            None => ResolvedPolicy {
                quarantine_threshold: self.defaults.quarantine_threshold,
                report_threshold: self.defaults.report_threshold,
                excluded: false,
                matched_pattern: None,
            },
        }
    }

    /// Whether a replica rule tells us to leave this replica alone
    pub fn is_ignored(&self, identity: &ReplicaIdentity) -> bool {
        self.replica_rules
            .iter()
            .any(|r| r.action == RuleAction::Ignore && r.matches(identity))
    }
}

fn positive(
    value: Option<i64>,
    field: &'static str,
) -> Result<Option<u32>, (&'static str, String)> {
    match value {
        None => Ok(None),
        Some(v) if v <= 0 => Err((field, format!("must be a positive integer, got {}", v))),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| (field, format!("must fit in 32 bits, got {}", v))),
    }
}

/// Returns (is exact, number of literal characters) for a glob pattern
fn literal_profile(pattern: &str) -> (bool, usize) {
    let mut literal = 0;
    let mut exact = true;
    let mut in_class = false;

    for c in pattern.chars() {
        match c {
            '[' if !in_class => {
                in_class = true;
                exact = false;
            }
            ']' if in_class => in_class = false,
            '*' | '?' if !in_class => exact = false,
            _ if in_class => {}
            _ => literal += 1,
        }
    }

    (exact, literal)
}

/// Owns the policy document location and the snapshot currently in force
#[derive(Debug)]
pub struct PolicyStore {
    path: Option<PathBuf>,
    defaults: PolicyDefaults,
    current: RwLock<Arc<Policy>>,
}

impl PolicyStore {
    /// Load the document at `path`, or use defaults only when `path` is `None`
    ///
    /// Fails on a missing or malformed document; the caller must treat this
    /// as fatal.
    pub fn load(path: Option<&Path>, defaults: PolicyDefaults) -> Result<Self, PolicyError> {
        let policy = match path {
            Some(p) => Policy::load(p, defaults)?,
            None => Policy::empty(defaults),
        };

        info!(
            path = ?path,
            overrides = policy.endpoints.len(),
            replica_rules = policy.replica_rules.len(),
            quarantine_threshold = defaults.quarantine_threshold,
            report_threshold = defaults.report_threshold,
            "Policy loaded"
        );

        Ok(Self {
            path: path.map(Path::to_path_buf),
            defaults,
            current: RwLock::new(Arc::new(policy)),
        })
    }

    /// Wrap an already validated policy (no reload source)
    pub fn from_policy(policy: Policy) -> Self {
        Self {
            path: None,
            defaults: policy.defaults,
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The policy snapshot in force right now
    pub fn snapshot(&self) -> Arc<Policy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the document
    ///
    /// On failure the previous snapshot stays in force and the error is
    /// returned for logging.
    pub fn reload(&self) -> Result<Arc<Policy>, PolicyError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.snapshot());
        };

        let policy = Arc::new(Policy::load(path, self.defaults)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = policy.clone();
        info!(path = %path.display(), "Policy reloaded");
        Ok(policy)
    }
}
