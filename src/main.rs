/*!
 * Recoverer CLI - Command Line Interface
 *
 * Runs the suspicious replica recoverer as a daemon (or a single pass with
 * --run-once), or validates a policy document with `check-policy`.
 */

use clap::{Parser, Subcommand, ValueEnum};
use recoverer::{
    app,
    config::{LogLevel, RecovererConfig},
    error::{RecovererError, Result, EXIT_SUCCESS},
    logging,
};
use recoverer_core::PolicyError;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "recoverer")]
#[command(version, about = "Escalate or quarantine replicas reported as suspicious", long_about = None)]
struct Cli {
    /// Only count suspicion reports younger than this many days
    #[arg(long = "younger-than", value_name = "DAYS")]
    younger_than: Option<u32>,

    /// Minimum number of reports for a replica to be considered
    #[arg(long)]
    nattempts: Option<u32>,

    /// Comma-separated tenants (VOs) to process; all when unset
    #[arg(long, value_delimiter = ',')]
    vos: Option<Vec<String>>,

    /// Run a single pass and exit
    #[arg(long = "run-once")]
    run_once: bool,

    /// Candidates per endpoint above which the endpoint is quarantined
    #[arg(long = "limit-suspicious-files-on-rse", value_name = "N")]
    limit_suspicious_files_on_rse: Option<u32>,

    /// Policy document with per-endpoint overrides (TOML or JSON)
    #[arg(long = "policy", value_name = "FILE")]
    policy: Option<PathBuf>,

    /// Seconds to sleep between passes
    #[arg(long = "sleep-time", value_name = "SECONDS")]
    sleep_time: Option<u64>,

    /// Apply decisions to the catalog (default is a dry run)
    #[arg(long = "active-mode")]
    active_mode: bool,

    /// Glob selecting the endpoints to evaluate
    #[arg(long = "rse-expression", value_name = "GLOB")]
    rse_expression: Option<String>,

    /// Re-read the policy document before every pass
    #[arg(long = "reload-policy")]
    reload_policy: bool,

    /// Endpoints of a tenant classified concurrently
    #[arg(long = "max-parallel-endpoints", value_name = "N")]
    max_parallel_endpoints: Option<usize>,

    /// Catalog location (sqlite: URL or database file)
    #[arg(long = "catalog", value_name = "URL")]
    catalog: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Path to log file (default: stdout)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a policy document and print every problem found
    CheckPolicy {
        /// Policy document to check
        path: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    if let Some(Commands::CheckPolicy { path }) = &cli.command {
        return handle_check_policy(path, &config);
    }

    logging::init_logging(&config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone()));

        let history = app::run(&config, cancel).await?;
        info!(
            passes = history.passes,
            cancelled = history.cancelled,
            "Recoverer finished"
        );
        Ok::<(), RecovererError>(())
    })
}

/// Config file first, then command-line overrides
fn build_config(cli: &Cli) -> Result<RecovererConfig> {
    let mut config = match &cli.config {
        Some(path) => RecovererConfig::from_file(path)?,
        None => RecovererConfig::default(),
    };

    if let Some(days) = cli.younger_than {
        config.younger_than_days = days;
    }
    if let Some(n) = cli.nattempts {
        config.nattempts = n;
    }
    if let Some(vos) = &cli.vos {
        config.vos = Some(vos.clone());
    }
    if let Some(n) = cli.limit_suspicious_files_on_rse {
        config.limit_suspicious_files_on_rse = n;
    }
    if let Some(path) = &cli.policy {
        config.policy_path = Some(path.clone());
    }
    if let Some(secs) = cli.sleep_time {
        config.sleep_time = secs;
    }
    if let Some(expr) = &cli.rse_expression {
        config.rse_expression = expr.clone();
    }
    if let Some(n) = cli.max_parallel_endpoints {
        config.max_parallel_endpoints = n;
    }
    if let Some(url) = &cli.catalog {
        config.catalog_url = Some(url.clone());
    }
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    if let Some(path) = &cli.log {
        config.log_file = Some(path.clone());
    }

    config.run_once |= cli.run_once;
    config.active_mode |= cli.active_mode;
    config.reload_policy_each_pass |= cli.reload_policy;
    config.verbose |= cli.verbose;

    Ok(config)
}

fn handle_check_policy(path: &Path, config: &RecovererConfig) -> Result<()> {
    match app::check_policy(path, config) {
        Ok(policy) => {
            println!(
                "✅ {}: {} endpoint override(s), {} replica rule(s)",
                path.display(),
                policy.endpoint_overrides().len(),
                policy.replica_rules().len()
            );
            let defaults = policy.defaults();
            for o in policy.endpoint_overrides() {
                println!(
                    "   {:<32} quarantine={:<5} reports={:<5} excluded={}",
                    o.pattern(),
                    o.quarantine_threshold.unwrap_or(defaults.quarantine_threshold),
                    o.report_threshold.unwrap_or(defaults.report_threshold),
                    o.excluded
                );
            }
            Ok(())
        }
        Err(RecovererError::Policy(err @ PolicyError::Invalid { .. })) => {
            eprintln!("❌ {}: {} issue(s)", path.display(), err.issues().len());
            for issue in err.issues() {
                eprintln!("   - {}", issue);
            }
            Err(RecovererError::Policy(err))
        }
        Err(e) => Err(e),
    }
}

/// Cancel the token on ctrl-c, or SIGTERM on unix
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Stop requested, finishing the current pass");
    cancel.cancel();
}
