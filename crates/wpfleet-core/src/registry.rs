//! Fleet registry: one SQLite row per tenant site.
//!
//! The applicator is the only writer of `baseline_version` and the
//! quarantine columns. Every write is a single statement keyed by domain, so
//! a crash mid-rollout leaves each row either updated or untouched.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sites (
    domain            TEXT PRIMARY KEY,
    site_path         TEXT NOT NULL,
    php_version       TEXT NOT NULL,
    cache_type        TEXT NOT NULL,
    is_ssl            INTEGER NOT NULL DEFAULT 0,
    shared_release    TEXT,
    baseline_version  INTEGER NOT NULL DEFAULT 0,
    is_enabled        INTEGER NOT NULL DEFAULT 1,
    is_staging        INTEGER NOT NULL DEFAULT 0,
    is_quarantined    INTEGER NOT NULL DEFAULT 0,
    quarantine_reason TEXT,
    quarantine_date   TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const SITE_COLUMNS: &str = "domain, site_path, php_version, cache_type, is_ssl, shared_release, \
     baseline_version, is_enabled, is_staging, is_quarantined, quarantine_reason, \
     quarantine_date, created_at, updated_at";

pub const META_INITIALIZED: &str = "initialized";
pub const META_CURRENT_RELEASE: &str = "current_release";

// ---------------------------------------------------------------------------
// TenantSite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSite {
    pub domain: String,
    pub site_path: String,
    pub php_version: String,
    pub cache_type: String,
    pub is_ssl: bool,
    pub shared_release: Option<String>,
    /// Last baseline version applied to this site; 0 means never.
    pub baseline_version: u64,
    pub is_enabled: bool,
    pub is_staging: bool,
    pub is_quarantined: bool,
    pub quarantine_reason: Option<String>,
    pub quarantine_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantSite {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            domain: row.get(0)?,
            site_path: row.get(1)?,
            php_version: row.get(2)?,
            cache_type: row.get(3)?,
            is_ssl: row.get(4)?,
            shared_release: row.get(5)?,
            baseline_version: row.get::<_, i64>(6)?.max(0) as u64,
            is_enabled: row.get(7)?,
            is_staging: row.get(8)?,
            is_quarantined: row.get(9)?,
            quarantine_reason: row.get(10)?,
            quarantine_date: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    /// A production site takes part in fleet-wide rollouts.
    pub fn is_production(&self) -> bool {
        self.is_enabled && !self.is_staging && !self.is_quarantined
    }

    pub fn lags(&self, version: u64) -> bool {
        self.baseline_version < version
    }
}

/// Attributes supplied when a provisioned site joins the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSite {
    pub domain: String,
    pub site_path: String,
    pub php_version: String,
    pub cache_type: String,
    pub is_ssl: bool,
    pub shared_release: Option<String>,
}

/// Counts shown by `status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetStats {
    pub total_sites: usize,
    pub enabled_sites: usize,
    pub ssl_sites: usize,
    pub staging_sites: usize,
    pub quarantined_sites: usize,
    pub php_distribution: BTreeMap<String, usize>,
    pub cache_distribution: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// FleetRegistry
// ---------------------------------------------------------------------------

pub struct FleetRegistry {
    conn: Connection,
}

impl FleetRegistry {
    /// Open or create the registry database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // -----------------------------------------------------------------------
    // Sites
    // -----------------------------------------------------------------------

    pub fn register(&self, site: &NewSite) -> Result<TenantSite> {
        if self.find(&site.domain)?.is_some() {
            return Err(FleetError::SiteExists(site.domain.clone()));
        }
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO sites (domain, site_path, php_version, cache_type, is_ssl, shared_release, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                site.domain,
                site.site_path,
                site.php_version,
                site.cache_type,
                site.is_ssl,
                site.shared_release,
                now
            ],
        )?;
        tracing::debug!(domain = %site.domain, "registered site");
        self.get(&site.domain)
    }

    pub fn find(&self, domain: &str) -> Result<Option<TenantSite>> {
        let sql = format!("SELECT {SITE_COLUMNS} FROM sites WHERE domain = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![domain], TenantSite::from_row)
            .optional()?)
    }

    pub fn get(&self, domain: &str) -> Result<TenantSite> {
        self.find(domain)?
            .ok_or_else(|| FleetError::SiteNotFound(domain.to_string()))
    }

    /// All sites in enumeration order (by domain).
    pub fn list(&self) -> Result<Vec<TenantSite>> {
        self.query_sites("1 = 1")
    }

    pub fn remove(&self, domain: &str) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM sites WHERE domain = ?1", params![domain])?;
        if n == 0 {
            return Err(FleetError::SiteNotFound(domain.to_string()));
        }
        Ok(())
    }

    pub fn set_enabled(&self, domain: &str, enabled: bool) -> Result<()> {
        self.update_one(
            domain,
            "UPDATE sites SET is_enabled = ?2, updated_at = ?3 WHERE domain = ?1",
            params![domain, enabled, Utc::now()],
        )
    }

    /// Point the release column of every site at `release`.
    pub fn set_release_for_all(&self, release: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE sites SET shared_release = ?1, updated_at = ?2",
            params![release, Utc::now()],
        )?)
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    /// Make `domain` the only staging site. Returns the previous staging domain, if different.
    pub fn set_staging(&self, domain: &str) -> Result<Option<String>> {
        let site = self.get(domain)?;
        let previous = self.staging_domain()?;
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        tx.execute(
            "UPDATE sites SET is_staging = 0, updated_at = ?1 WHERE is_staging = 1",
            params![now],
        )?;
        tx.execute(
            "UPDATE sites SET is_staging = 1, updated_at = ?2 WHERE domain = ?1",
            params![site.domain, now],
        )?;
        tx.commit()?;
        Ok(previous.filter(|p| p != domain))
    }

    pub fn clear_staging(&self, domain: &str) -> Result<()> {
        self.update_one(
            domain,
            "UPDATE sites SET is_staging = 0, updated_at = ?2 WHERE domain = ?1",
            params![domain, Utc::now()],
        )
    }

    /// The enabled staging site, if one is designated.
    pub fn staging_site(&self) -> Result<Option<TenantSite>> {
        Ok(self
            .query_sites("is_staging = 1 AND is_enabled = 1")?
            .into_iter()
            .next())
    }

    fn staging_domain(&self) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT domain FROM sites WHERE is_staging = 1 ORDER BY domain LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Enabled, non-staging, non-quarantined sites in enumeration order.
    pub fn production_sites(&self) -> Result<Vec<TenantSite>> {
        self.query_sites("is_enabled = 1 AND is_staging = 0 AND is_quarantined = 0")
    }

    // -----------------------------------------------------------------------
    // Baseline bookkeeping
    // -----------------------------------------------------------------------

    pub fn mark_applied(&self, domain: &str, version: u64) -> Result<()> {
        self.update_one(
            domain,
            "UPDATE sites SET baseline_version = ?2, updated_at = ?3 WHERE domain = ?1",
            params![domain, version as i64, Utc::now()],
        )
    }

    /// Quarantine `domain`. Re-quarantining overwrites reason and date.
    pub fn quarantine(&self, domain: &str, reason: &str) -> Result<()> {
        let now = Utc::now();
        self.update_one(
            domain,
            "UPDATE sites SET is_quarantined = 1, quarantine_reason = ?2, quarantine_date = ?3, \
             updated_at = ?3 WHERE domain = ?1",
            params![domain, reason, now],
        )
    }

    pub fn clear_quarantine(&self, domain: &str) -> Result<()> {
        self.update_one(
            domain,
            "UPDATE sites SET is_quarantined = 0, quarantine_reason = NULL, quarantine_date = NULL, \
             updated_at = ?2 WHERE domain = ?1",
            params![domain, Utc::now()],
        )
    }

    pub fn quarantined(&self) -> Result<Vec<TenantSite>> {
        self.query_sites("is_quarantined = 1")
    }

    /// Enabled sites whose applied version lags `version`.
    pub fn drifted(&self, version: u64) -> Result<Vec<TenantSite>> {
        Ok(self
            .query_sites("is_enabled = 1")?
            .into_iter()
            .filter(|s| s.lags(version))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?)
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.meta(META_INITIALIZED)?.as_deref() == Some("true"))
    }

    pub fn mark_initialized(&self) -> Result<()> {
        self.set_meta(META_INITIALIZED, "true")
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<FleetStats> {
        let sites = self.list()?;
        let mut stats = FleetStats {
            total_sites: sites.len(),
            ..FleetStats::default()
        };
        for s in &sites {
            stats.enabled_sites += usize::from(s.is_enabled);
            stats.ssl_sites += usize::from(s.is_ssl);
            stats.staging_sites += usize::from(s.is_staging);
            stats.quarantined_sites += usize::from(s.is_quarantined);
            *stats
                .php_distribution
                .entry(s.php_version.clone())
                .or_default() += 1;
            *stats
                .cache_distribution
                .entry(s.cache_type.clone())
                .or_default() += 1;
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn query_sites(&self, filter: &str) -> Result<Vec<TenantSite>> {
        let sql = format!("SELECT {SITE_COLUMNS} FROM sites WHERE {filter} ORDER BY domain");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], TenantSite::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn update_one(&self, domain: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let n = self.conn.execute(sql, params)?;
        if n == 0 {
            return Err(FleetError::SiteNotFound(domain.to_string()));
        }
        Ok(())
    }

    /// Raw SQL for tests that need to break the database underneath a caller.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
