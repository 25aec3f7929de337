/*!
 * Configuration types for the recoverer daemon
 */

use recoverer_core::{ClassifierConfig, PolicyDefaults, RunOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RecovererError, Result};

/// Main configuration for a recoverer run
///
/// Loaded from a TOML file with `--config`; command-line flags override
/// individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecovererConfig {
    /// Trailing window for counting suspicion reports, in days
    #[serde(default = "default_younger_than")]
    pub younger_than_days: u32,

    /// Minimum report count for a replica to become a candidate
    #[serde(default = "default_nattempts")]
    pub nattempts: u32,

    /// Explicit tenant (VO) set; all known tenants when unset
    #[serde(default)]
    pub vos: Option<Vec<String>>,

    /// Execute a single pass and exit
    #[serde(default)]
    pub run_once: bool,

    /// Candidate count per endpoint above which the endpoint is quarantined
    #[serde(default = "default_limit_suspicious")]
    pub limit_suspicious_files_on_rse: u32,

    /// Policy document with per-endpoint overrides
    #[serde(default)]
    pub policy_path: Option<PathBuf>,

    /// Seconds to sleep between passes
    #[serde(default = "default_sleep_time")]
    pub sleep_time: u64,

    /// Apply decisions to the catalog (dry run otherwise)
    #[serde(default)]
    pub active_mode: bool,

    /// Glob selecting the endpoints to evaluate
    #[serde(default = "default_rse_expression")]
    pub rse_expression: String,

    /// Endpoints of one tenant classified concurrently
    #[serde(default = "default_max_parallel_endpoints")]
    pub max_parallel_endpoints: usize,

    /// Re-read the policy document before each pass
    #[serde(default)]
    pub reload_policy_each_pass: bool,

    /// Catalog location (`sqlite:` URL or database path)
    #[serde(default)]
    pub catalog_url: Option<String>,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file (JSON lines); stdout when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Shortcut for debug logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for RecovererConfig {
    fn default() -> Self {
        Self {
            younger_than_days: default_younger_than(),
            nattempts: default_nattempts(),
            vos: None,
            run_once: false,
            limit_suspicious_files_on_rse: default_limit_suspicious(),
            policy_path: None,
            sleep_time: default_sleep_time(),
            active_mode: false,
            rse_expression: default_rse_expression(),
            max_parallel_endpoints: default_max_parallel_endpoints(),
            reload_policy_each_pass: false,
            catalog_url: None,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_younger_than() -> u32 {
    3
}

fn default_nattempts() -> u32 {
    10
}

fn default_limit_suspicious() -> u32 {
    5
}

fn default_sleep_time() -> u64 {
    3600
}

fn default_rse_expression() -> String {
    "*".to_string()
}

fn default_max_parallel_endpoints() -> usize {
    1
}

impl RecovererConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RecovererError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents)
            .map_err(|e| RecovererError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject settings that would make every pass meaningless or unsafe
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.younger_than_days == 0 {
            problems.push("younger_than_days must be at least 1".into());
        } else if chrono::Duration::try_days(i64::from(self.younger_than_days))
            .and_then(|window| chrono::Utc::now().checked_sub_signed(window))
            .is_none()
        {
            problems.push(format!(
                "younger_than_days {} reaches past the supported date range",
                self.younger_than_days
            ));
        }
        if self.nattempts == 0 {
            problems.push("nattempts must be at least 1".into());
        }
        if self.limit_suspicious_files_on_rse == 0 {
            problems.push("limit_suspicious_files_on_rse must be at least 1".into());
        }
        if self.max_parallel_endpoints == 0 {
            problems.push("max_parallel_endpoints must be at least 1".into());
        }
        if self.rse_expression.trim().is_empty() {
            problems.push("rse_expression must not be empty".into());
        } else if let Err(e) = glob::Pattern::new(&self.rse_expression) {
            problems.push(format!(
                "rse_expression {:?} is not a valid glob: {}",
                self.rse_expression, e
            ));
        }
        if matches!(&self.vos, Some(v) if v.is_empty()) {
            problems.push("vos must not be an empty list".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RecovererError::Config(problems.join("; ")))
        }
    }

    /// Global thresholds used where the policy has no override
    pub fn policy_defaults(&self) -> PolicyDefaults {
        PolicyDefaults {
            quarantine_threshold: self.limit_suspicious_files_on_rse,
            report_threshold: self.nattempts,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            window: chrono::Duration::days(i64::from(self.younger_than_days)),
            endpoint_pattern: self.rse_expression.clone(),
            max_parallel_endpoints: self.max_parallel_endpoints,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            run_once: self.run_once,
            sleep_time: Duration::from_secs(self.sleep_time),
            active_mode: self.active_mode,
            reload_policy_each_pass: self.reload_policy_each_pass,
            max_passes: None,
        }
    }
}
