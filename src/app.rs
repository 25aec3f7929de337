/*!
 * Daemon wiring: config -> policy -> catalog -> tenants -> scheduler
 */

use recoverer_core::backends::SqliteCatalog;
use recoverer_core::{resolve_tenants, PassHistory, Policy, PolicyStore, Scheduler};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RecovererConfig;
use crate::error::{RecovererError, Result};

/// Load the policy store; any document problem is fatal
pub fn load_policy(config: &RecovererConfig) -> Result<PolicyStore> {
    Ok(PolicyStore::load(
        config.policy_path.as_deref(),
        config.policy_defaults(),
    )?)
}

/// Validate a policy document without touching the catalog
pub fn check_policy(path: &Path, config: &RecovererConfig) -> Result<Policy> {
    Ok(Policy::load(path, config.policy_defaults())?)
}

/// Open the configured catalog
pub async fn open_catalog(config: &RecovererConfig) -> Result<SqliteCatalog> {
    let location = config.catalog_url.as_deref().ok_or_else(|| {
        RecovererError::Config("no catalog configured (use --catalog or catalog_url)".to_string())
    })?;
    Ok(SqliteCatalog::open(location).await?)
}

/// Run the daemon until run-once completes or `cancel` fires
///
/// Configuration and policy are validated before the catalog is touched, so
/// a bad document never leads to a pass.
pub async fn run(config: &RecovererConfig, cancel: CancellationToken) -> Result<PassHistory> {
    config.validate()?;
    let policy = Arc::new(load_policy(config)?);

    let catalog = Arc::new(open_catalog(config).await?);
    let tenants = resolve_tenants(catalog.as_ref(), config.vos.as_deref()).await?;
    if tenants.is_empty() {
        warn!("No tenants to process");
    } else {
        info!(tenants = ?tenants, "Tenant set resolved");
    }

    let scheduler = Scheduler::with_catalog(catalog, policy, config.classifier_config());
    let history = scheduler.run(config.run_options(), &tenants, cancel).await;

    if config.run_once {
        if let Some(last) = history.last.as_ref().filter(|r| r.stats.has_failures()) {
            return Err(RecovererError::PassIncomplete {
                endpoints_failed: last.stats.endpoints_failed,
                actions_failed: last.stats.actions_failed,
            });
        }
    }

    Ok(history)
}
