//! SQLite catalog backend
//!
//! Reads suspicion reports and replica states from a SQLite database with the
//! schema in `migrations/`. Candidate rows are streamed straight from the
//! cursor; the batch availability check is answered with a single join.

use crate::catalog::{
    window_start, AvailabilityProbe, CandidateStream, EndpointDirectory, ReplicaStateWriter,
    SuspicionQuery, TenantDirectory, TransitionOutcome,
};
use crate::error::{CatalogError, CatalogResult};
use crate::types::{Endpoint, ReplicaIdentity, ReplicaState, SuspiciousReplicaRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use glob::Pattern;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::debug;

const FIND_CANDIDATES: &str = "
    SELECT r.scope AS scope, r.name AS name,
           COUNT(*) AS report_count,
           MIN(r.reported_at) AS first_reported_at,
           MAX(r.reported_at) AS last_reported_at
    FROM suspicious_reports r
    JOIN replicas p
      ON p.scope = r.scope AND p.name = r.name AND p.endpoint = r.endpoint
    JOIN endpoints e ON e.name = r.endpoint
    WHERE r.endpoint = ? AND e.tenant = ? AND p.state = 'S' AND r.reported_at >= ?
    GROUP BY r.scope, r.name
    HAVING COUNT(*) >= ?
    ORDER BY r.scope, r.name";

const AVAILABLE_ELSEWHERE: &str = "
    SELECT EXISTS (
        SELECT 1 FROM replicas
        WHERE scope = ? AND name = ? AND endpoint <> ? AND state = 'A'
    )";

const AVAILABLE_ELSEWHERE_BATCH: &str = "
    SELECT DISTINCT p.scope AS scope, p.name AS name
    FROM replicas p
    JOIN json_each(?) j
      ON p.scope = json_extract(j.value, '$[0]') AND p.name = json_extract(j.value, '$[1]')
    WHERE p.endpoint <> ? AND p.state = 'A'";

/// SQLite-backed replica catalog
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Open or create a catalog database and bring its schema up to date
    ///
    /// Accepts either a `sqlite:` URL or a plain file path.
    pub async fn open(location: &str) -> CatalogResult<Self> {
        let url = if location.starts_with("sqlite:") {
            location.to_string()
        } else {
            format!("sqlite://{}", location)
        };
        let in_memory = url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| CatalogError::unavailable("migrate", e.to_string()))?;

        debug!(url = %url, "SQLite catalog opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn add_endpoint(&self, tenant: &str, endpoint: &str) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO endpoints (name, tenant) VALUES (?, ?)
             ON CONFLICT (name) DO UPDATE SET tenant = excluded.tenant",
        )
        .bind(endpoint)
        .bind(tenant)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_replica(
        &self,
        identity: &ReplicaIdentity,
        endpoint: &str,
        state: ReplicaState,
    ) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO replicas (scope, name, endpoint, state, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (scope, name, endpoint) DO UPDATE
             SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(&identity.scope)
        .bind(&identity.name)
        .bind(endpoint)
        .bind(state.code())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record one suspicion report; an AVAILABLE replica becomes SUSPICIOUS
    pub async fn report_suspicious(
        &self,
        identity: &ReplicaIdentity,
        endpoint: &str,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> CatalogResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO suspicious_reports (scope, name, endpoint, reported_at, reason)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&identity.scope)
        .bind(&identity.name)
        .bind(endpoint)
        .bind(at.timestamp())
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE replicas SET state = 'S', updated_at = ?
             WHERE scope = ? AND name = ? AND endpoint = ? AND state = 'A'",
        )
        .bind(Utc::now().timestamp())
        .bind(&identity.scope)
        .bind(&identity.name)
        .bind(endpoint)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn state_of(
        &self,
        identity: &ReplicaIdentity,
        endpoint: &str,
    ) -> CatalogResult<Option<ReplicaState>> {
        let code: Option<String> = sqlx::query_scalar(
            "SELECT state FROM replicas WHERE scope = ? AND name = ? AND endpoint = ?",
        )
        .bind(&identity.scope)
        .bind(&identity.name)
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        code.map(|c| parse_state(&c)).transpose()
    }

    async fn available_set(
        &self,
        identities: &[ReplicaIdentity],
        excluding: &Endpoint,
    ) -> CatalogResult<HashSet<ReplicaIdentity>> {
        let keys: Vec<[&str; 2]> = identities
            .iter()
            .map(|i| [i.scope.as_str(), i.name.as_str()])
            .collect();
        let payload = serde_json::to_string(&keys)
            .map_err(|e| CatalogError::unavailable("available_elsewhere", e.to_string()))?;

        let rows = sqlx::query(AVAILABLE_ELSEWHERE_BATCH)
            .bind(payload)
            .bind(excluding.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(ReplicaIdentity::new(
                    row.try_get::<String, _>("scope")?,
                    row.try_get::<String, _>("name")?,
                ))
            })
            .collect()
    }
}

fn parse_state(code: &str) -> CatalogResult<ReplicaState> {
    code.parse()
        .map_err(|e: String| CatalogError::unavailable("decode", e))
}

fn timestamp(secs: i64) -> CatalogResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| CatalogError::unavailable("decode", format!("invalid timestamp {secs}")))
}

fn record_from_row(row: &SqliteRow, endpoint: &Endpoint) -> CatalogResult<SuspiciousReplicaRecord> {
    let count: i64 = row.try_get("report_count")?;
    Ok(SuspiciousReplicaRecord {
        identity: ReplicaIdentity::new(
            row.try_get::<String, _>("scope")?,
            row.try_get::<String, _>("name")?,
        ),
        endpoint: endpoint.clone(),
        report_count: u32::try_from(count).unwrap_or(u32::MAX),
        first_reported_at: timestamp(row.try_get("first_reported_at")?)?,
        last_reported_at: timestamp(row.try_get("last_reported_at")?)?,
    })
}

#[async_trait]
impl TenantDirectory for SqliteCatalog {
    async fn list_tenants(&self) -> CatalogResult<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT tenant FROM endpoints ORDER BY tenant")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl EndpointDirectory for SqliteCatalog {
    async fn list_endpoints(&self, tenant: &str, pattern: &str) -> CatalogResult<Vec<Endpoint>> {
        let matcher = Pattern::new(pattern).map_err(|e| {
            CatalogError::unavailable("list_endpoints", format!("invalid pattern {pattern:?}: {e}"))
        })?;

        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM endpoints WHERE tenant = ? ORDER BY name")
                .bind(tenant)
                .fetch_all(&self.pool)
                .await?;

        Ok(names
            .into_iter()
            .filter(|name| matcher.matches(name))
            .map(Endpoint::new)
            .collect())
    }
}

#[async_trait]
impl SuspicionQuery for SqliteCatalog {
    async fn find(
        &self,
        tenant: &str,
        endpoint: &Endpoint,
        window: Duration,
        threshold: u32,
    ) -> CatalogResult<CandidateStream<'_>> {
        let cutoff = window_start(window)?.timestamp();
        let endpoint = endpoint.clone();

        let rows = sqlx::query(FIND_CANDIDATES)
            .bind(endpoint.as_str().to_owned())
            .bind(tenant.to_owned())
            .bind(cutoff)
            .bind(i64::from(threshold))
            .fetch(&self.pool);

        Ok(rows
            .map(move |row| {
                row.map_err(CatalogError::from)
                    .and_then(|row| record_from_row(&row, &endpoint))
            })
            .boxed())
    }
}

#[async_trait]
impl AvailabilityProbe for SqliteCatalog {
    async fn has_available_elsewhere(
        &self,
        identity: &ReplicaIdentity,
        excluding: &Endpoint,
    ) -> CatalogResult<bool> {
        Ok(sqlx::query_scalar(AVAILABLE_ELSEWHERE)
            .bind(&identity.scope)
            .bind(&identity.name)
            .bind(excluding.as_str())
            .fetch_one(&self.pool)
            .await?)
    }

    async fn available_elsewhere(
        &self,
        identities: &[ReplicaIdentity],
        excluding: &Endpoint,
    ) -> HashMap<ReplicaIdentity, CatalogResult<bool>> {
        match self.available_set(identities, excluding).await {
            Ok(available) => identities
                .iter()
                .map(|i| (i.clone(), Ok(available.contains(i))))
                .collect(),
            Err(e) => identities
                .iter()
                .map(|i| (i.clone(), Err(e.clone())))
                .collect(),
        }
    }
}

#[async_trait]
impl ReplicaStateWriter for SqliteCatalog {
    async fn transition(
        &self,
        identity: &ReplicaIdentity,
        endpoint: &Endpoint,
        from: ReplicaState,
        to: ReplicaState,
    ) -> CatalogResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT state FROM replicas WHERE scope = ? AND name = ? AND endpoint = ?",
        )
        .bind(&identity.scope)
        .bind(&identity.name)
        .bind(endpoint.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let state = match current {
            Some(code) => parse_state(&code)?,
            None => {
                return Err(CatalogError::NotFound {
                    identity: identity.clone(),
                    endpoint: endpoint.clone(),
                })
            }
        };

        if state == to {
            return Ok(TransitionOutcome::AlreadyInState);
        }
        if state != from {
            return Ok(TransitionOutcome::StateChanged(state));
        }

        let updated = sqlx::query(
            "UPDATE replicas SET state = ?, updated_at = ?
             WHERE scope = ? AND name = ? AND endpoint = ? AND state = ?",
        )
        .bind(to.code())
        .bind(Utc::now().timestamp())
        .bind(&identity.scope)
        .bind(&identity.name)
        .bind(endpoint.as_str())
        .bind(from.code())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if updated.rows_affected() == 1 {
            Ok(TransitionOutcome::Applied)
        } else {
            Err(CatalogError::unavailable(
                "transition",
                format!("concurrent update of {identity} on {endpoint}"),
            ))
        }
    }
}
