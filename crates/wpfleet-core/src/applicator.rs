//! Baseline rollout: staging gate, sequential per-site apply, quarantine.
//!
//! A rollout never aborts halfway through production. The only abort points
//! are before the first production site is touched: a failing staging site,
//! or an operator declining to continue without one. After that each site
//! either converges to the target version or is quarantined with the error
//! that stopped it, and the pass moves on.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::baseline::Baseline;
use crate::cache::CacheController;
use crate::catalog::ArtifactCatalog;
use crate::error::{FleetError, Result};
use crate::registry::{FleetRegistry, TenantSite};
use crate::runtime::SiteRuntimeDriver;

const ACTIVE_PLUGINS: &str = "active_plugins";

/// Site option holding the last baseline version applied to the site. The
/// enforcer MU-plugin reads it to decide whether a site still lags.
pub const BASELINE_VERSION_OPTION: &str = "wpfleet_baseline_version";

/// Where a rollout is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Pending,
    StagingTest,
    StagingPassed,
    StagingFailed,
    StagingSkipped,
    RollingOut,
    Done,
    Aborted,
}

/// What happened on the staging site before production was touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StagingOutcome {
    Passed { domain: String },
    /// No staging site; continued because of `--force` or operator consent.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedSite {
    pub domain: String,
    pub reason: String,
}

/// Result of one rollout pass over the fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutReport {
    pub version: u64,
    pub phase: RolloutPhase,
    pub staging: StagingOutcome,
    /// Production sites targeted.
    pub total: usize,
    pub applied: Vec<String>,
    pub quarantined: Vec<QuarantinedSite>,
    pub cache_cleared: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RolloutReport {
    /// `1/2 applied, 1 quarantined`
    pub fn summary(&self) -> String {
        format!(
            "{}/{} applied, {} quarantined",
            self.applied.len(),
            self.total,
            self.quarantined.len()
        )
    }
}

/// Outcome of re-applying the baseline to a single site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SiteOutcome {
    Applied { domain: String, version: u64 },
    Quarantined { domain: String, reason: String },
}

/// Asked before rolling out without a staging site.
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

// ---------------------------------------------------------------------------
// BaselineApplicator
// ---------------------------------------------------------------------------

/// Stateless: everything it knows comes from its arguments and collaborators.
pub struct BaselineApplicator<'a> {
    catalog: &'a ArtifactCatalog,
    driver: &'a dyn SiteRuntimeDriver,
    cache: &'a dyn CacheController,
}

impl<'a> BaselineApplicator<'a> {
    pub fn new(
        catalog: &'a ArtifactCatalog,
        driver: &'a dyn SiteRuntimeDriver,
        cache: &'a dyn CacheController,
    ) -> Self {
        Self {
            catalog,
            driver,
            cache,
        }
    }

    /// Converge one site to `baseline`. On any failure the site's
    /// `active_plugins` is put back to what it was before this call.
    pub fn apply_to_site(&self, site_path: &Path, baseline: &Baseline) -> Result<()> {
        let snapshot = match self.driver.get_option(site_path, ACTIVE_PLUGINS) {
            Ok(Some(v)) => v,
            Ok(None) => {
                return Err(FleetError::Runtime(
                    "could not read current plugins".to_string(),
                ))
            }
            Err(e) => return Err(e.while_doing("could not read current plugins")),
        };

        let result = self.converge(site_path, baseline);
        if result.is_err() {
            self.restore_plugins(site_path, &snapshot);
        }
        result
    }

    fn converge(&self, site_path: &Path, baseline: &Baseline) -> Result<()> {
        for slug in &baseline.plugins {
            let entry = self
                .catalog
                .plugin_entry_file(slug)
                .ok_or_else(|| FleetError::PluginNotFound(slug.clone()))?;
            self.driver
                .activate_plugin(site_path, &entry)
                .map_err(|e| e.while_doing(&format!("failed to activate {slug}")))?;
        }

        if let Some(theme) = &baseline.theme {
            self.driver
                .activate_theme(site_path, theme)
                .map_err(|e| e.while_doing(&format!("failed to activate theme {theme}")))?;
        }

        for (name, value) in &baseline.options {
            if self.driver.get_option(site_path, name)?.is_none() {
                self.driver.set_option(site_path, name, value)?;
                debug!(site = %site_path.display(), option = %name, "set option default");
            }
        }

        self.driver.set_option(
            site_path,
            BASELINE_VERSION_OPTION,
            &Value::from(baseline.version),
        )?;
        Ok(())
    }

    fn restore_plugins(&self, site_path: &Path, snapshot: &Value) {
        match self.driver.set_option(site_path, ACTIVE_PLUGINS, snapshot) {
            Ok(()) => debug!(site = %site_path.display(), "restored active plugins"),
            Err(e) => warn!(site = %site_path.display(), error = %e, "could not restore active plugins"),
        }
    }

    /// Roll `baseline` out across the fleet.
    ///
    /// Per-site failures end up in the report. Errors are `StagingFailed` or
    /// `Aborted` before production is touched, or a registry failure, after
    /// which caches are still cleared for the sites already converged.
    pub fn rollout(
        &self,
        registry: &FleetRegistry,
        baseline: &Baseline,
        force: bool,
        confirm: &dyn Confirm,
    ) -> Result<RolloutReport> {
        let started_at = Utc::now();
        let mut phase = RolloutPhase::Pending;
        let version = baseline.version;

        let staging = match registry.staging_site()? {
            Some(site) => {
                phase = self.advance(phase, RolloutPhase::StagingTest, version);
                info!(domain = %site.domain, version, "testing baseline on staging site");
                if let Err(e) = self.apply_to_site(Path::new(&site.site_path), baseline) {
                    self.advance(phase, RolloutPhase::StagingFailed, version);
                    warn!(domain = %site.domain, error = %e, "staging test failed, production untouched");
                    return Err(FleetError::StagingFailed {
                        domain: site.domain,
                        reason: e.to_string(),
                    });
                }
                registry.mark_applied(&site.domain, version)?;
                phase = self.advance(phase, RolloutPhase::StagingPassed, version);
                StagingOutcome::Passed {
                    domain: site.domain,
                }
            }
            None => {
                warn!("no staging site, skipping pre-production test");
                if !force && !confirm.confirm("Continue without staging test?") {
                    self.advance(phase, RolloutPhase::Aborted, version);
                    return Err(FleetError::Aborted);
                }
                phase = self.advance(phase, RolloutPhase::StagingSkipped, version);
                StagingOutcome::Skipped
            }
        };

        let targets = registry.production_sites()?;
        phase = self.advance(phase, RolloutPhase::RollingOut, version);
        info!(version, sites = targets.len(), "applying baseline to production");

        let mut applied = Vec::new();
        let mut quarantined = Vec::new();
        for site in &targets {
            let outcome = match self.apply_and_record(registry, site, baseline) {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Sites already converged still serve stale pages until caches go.
                    warn!(domain = %site.domain, error = %e, "registry write failed, stopping rollout");
                    self.clear_caches();
                    return Err(e);
                }
            };
            match outcome {
                SiteOutcome::Applied { domain, .. } => applied.push(domain),
                SiteOutcome::Quarantined { domain, reason } => {
                    quarantined.push(QuarantinedSite { domain, reason })
                }
            }
        }

        let cache_cleared = self.clear_caches();
        phase = self.advance(phase, RolloutPhase::Done, version);

        let report = RolloutReport {
            version,
            phase,
            staging,
            total: targets.len(),
            applied,
            quarantined,
            cache_cleared,
            started_at,
            finished_at: Utc::now(),
        };
        info!(version, summary = %report.summary(), "rollout finished");
        Ok(report)
    }

    /// Clear a site's quarantine and try the current baseline on it again.
    /// A failure puts it straight back into quarantine with the new reason.
    pub fn unquarantine(
        &self,
        registry: &FleetRegistry,
        baseline: &Baseline,
        domain: &str,
    ) -> Result<SiteOutcome> {
        registry.clear_quarantine(domain)?;
        info!(domain, "quarantine cleared, re-applying baseline");
        let site = registry.get(domain)?;
        self.apply_and_record(registry, &site, baseline)
    }

    /// Apply to one site and write the result to the registry.
    fn apply_and_record(
        &self,
        registry: &FleetRegistry,
        site: &TenantSite,
        baseline: &Baseline,
    ) -> Result<SiteOutcome> {
        match self.apply_to_site(Path::new(&site.site_path), baseline) {
            Ok(()) => {
                registry.mark_applied(&site.domain, baseline.version)?;
                info!(domain = %site.domain, version = baseline.version, "site converged");
                Ok(SiteOutcome::Applied {
                    domain: site.domain.clone(),
                    version: baseline.version,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                registry.quarantine(&site.domain, &reason)?;
                warn!(domain = %site.domain, reason = %reason, "site quarantined");
                Ok(SiteOutcome::Quarantined {
                    domain: site.domain.clone(),
                    reason,
                })
            }
        }
    }

    fn clear_caches(&self) -> bool {
        let cleared = self.cache.clear_all_caches();
        if !cleared {
            warn!("cache clear failed after rollout");
        }
        cleared
    }

    fn advance(&self, from: RolloutPhase, to: RolloutPhase, version: u64) -> RolloutPhase {
        debug!(version, ?from, ?to, "rollout phase");
        to
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{add_site, install_plugin, FakeCache, FakeDriver, Fixture};
    use std::cell::Cell;

    fn baseline(version: u64, plugins: &[&str], theme: Option<&str>) -> Baseline {
        let mut b = Baseline::initial(
            plugins.iter().map(|s| s.to_string()).collect(),
            theme.map(str::to_string),
            Default::default(),
        );
        b.version = version;
        b
    }

    fn never(_: &str) -> bool {
        panic!("confirmation must not be requested")
    }

    #[test]
    fn apply_activates_plugins_in_order_then_theme() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        install_plugin(fx.root(), "p2");
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        app.apply_to_site(Path::new("/srv/a"), &baseline(2, &["p1", "p2"], Some("astra")))
            .unwrap();

        assert_eq!(driver.active_plugins("/srv/a"), vec!["p1/p1.php", "p2/p2.php"]);
        assert_eq!(driver.theme("/srv/a").as_deref(), Some("astra"));
    }

    #[test]
    fn apply_is_idempotent() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);
        let b = baseline(2, &["p1"], Some("astra"));

        app.apply_to_site(Path::new("/srv/a"), &b).unwrap();
        let first = driver.state("/srv/a");
        app.apply_to_site(Path::new("/srv/a"), &b).unwrap();
        assert_eq!(driver.state("/srv/a"), first);
    }

    #[test]
    fn missing_plugin_restores_snapshot() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        let driver = FakeDriver::new();
        driver.seed_plugins("/srv/a", &["old/old.php"]);
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let err = app
            .apply_to_site(Path::new("/srv/a"), &baseline(2, &["p1", "ghost"], None))
            .unwrap_err();
        assert!(matches!(err, FleetError::PluginNotFound(ref s) if s == "ghost"));
        assert_eq!(driver.active_plugins("/srv/a"), vec!["old/old.php"]);
    }

    #[test]
    fn theme_failure_restores_snapshot() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        let driver = FakeDriver::new();
        driver.fail_theme("/srv/a");
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let err = app
            .apply_to_site(Path::new("/srv/a"), &baseline(2, &["p1"], Some("broken")))
            .unwrap_err();
        assert!(err.to_string().contains("failed to activate theme broken"), "{err}");
        assert!(driver.active_plugins("/srv/a").is_empty());
    }

    #[test]
    fn unreadable_plugins_fail_without_changes() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        let driver = FakeDriver::new();
        driver.unreachable("/srv/a");
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let err = app
            .apply_to_site(Path::new("/srv/a"), &baseline(2, &["p1"], None))
            .unwrap_err();
        assert!(err.to_string().contains("could not read current plugins"), "{err}");
    }

    #[test]
    fn option_defaults_do_not_override_site_values() {
        let fx = Fixture::new();
        let driver = FakeDriver::new();
        driver.seed_option("/srv/a", "timezone_string", serde_json::json!("Europe/Oslo"));
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);
        let mut b = baseline(2, &[], None);
        b.options.insert("timezone_string".into(), serde_json::json!("UTC"));
        b.options.insert("blog_public".into(), serde_json::json!(0));

        app.apply_to_site(Path::new("/srv/a"), &b).unwrap();
        assert_eq!(
            driver.option("/srv/a", "timezone_string"),
            Some(serde_json::json!("Europe/Oslo"))
        );
        assert_eq!(driver.option("/srv/a", "blog_public"), Some(serde_json::json!(0)));
    }

    #[test]
    fn staging_then_production_with_one_quarantine() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        add_site(&fx.registry, "s1.test");
        add_site(&fx.registry, "s2.test");
        add_site(&fx.registry, "st.test");
        fx.registry.set_staging("st.test").unwrap();

        let driver = FakeDriver::new();
        driver.fail_activation(&fx.site_path("s2.test"), "p1/p1.php");
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let report = app
            .rollout(&fx.registry, &baseline(2, &["p1"], None), false, &never)
            .unwrap();

        assert_eq!(report.summary(), "1/2 applied, 1 quarantined");
        assert_eq!(
            report.staging,
            StagingOutcome::Passed {
                domain: "st.test".into()
            }
        );
        assert_eq!(report.phase, RolloutPhase::Done);
        assert_eq!(report.quarantined[0].domain, "s2.test");
        assert_eq!(fx.registry.get("s1.test").unwrap().baseline_version, 2);
        assert_eq!(fx.registry.get("st.test").unwrap().baseline_version, 2);
        let s2 = fx.registry.get("s2.test").unwrap();
        assert!(s2.is_quarantined);
        assert_eq!(s2.baseline_version, 0);
        assert!(s2.quarantine_reason.unwrap().contains("p1"));
        assert_eq!(cache.clears(), 1);
    }

    #[test]
    fn staging_failure_blocks_production() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        add_site(&fx.registry, "s1.test");
        add_site(&fx.registry, "st.test");
        fx.registry.set_staging("st.test").unwrap();

        let driver = FakeDriver::new();
        driver.fail_activation(&fx.site_path("st.test"), "p1/p1.php");
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let err = app
            .rollout(&fx.registry, &baseline(2, &["p1"], None), true, &never)
            .unwrap_err();
        assert!(matches!(err, FleetError::StagingFailed { ref domain, .. } if domain == "st.test"));
        assert_eq!(driver.calls_for(&fx.site_path("s1.test")), 0);
        assert_eq!(fx.registry.get("s1.test").unwrap().baseline_version, 0);
        assert!(!fx.registry.get("st.test").unwrap().is_quarantined);
        assert_eq!(cache.clears(), 0);
    }

    #[test]
    fn forced_rollout_without_staging_skips_prompt() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        add_site(&fx.registry, "a.test");
        add_site(&fx.registry, "b.test");
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let report = app
            .rollout(&fx.registry, &baseline(3, &["p1"], None), true, &never)
            .unwrap();
        assert_eq!(report.staging, StagingOutcome::Skipped);
        assert_eq!(report.summary(), "2/2 applied, 0 quarantined");
        assert!(fx.registry.list().unwrap().iter().all(|s| s.baseline_version == 3));
    }

    #[test]
    fn declined_confirmation_aborts() {
        let fx = Fixture::new();
        add_site(&fx.registry, "a.test");
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);
        let asked = Cell::new(false);
        let decline = |_: &str| {
            asked.set(true);
            false
        };

        let err = app
            .rollout(&fx.registry, &baseline(2, &[], None), false, &decline)
            .unwrap_err();
        assert!(matches!(err, FleetError::Aborted));
        assert!(asked.get());
        assert_eq!(driver.calls_for(&fx.site_path("a.test")), 0);
    }

    #[test]
    fn quarantined_and_disabled_sites_are_skipped() {
        let fx = Fixture::new();
        add_site(&fx.registry, "a.test");
        add_site(&fx.registry, "q.test");
        add_site(&fx.registry, "off.test");
        fx.registry.quarantine("q.test", "earlier failure").unwrap();
        fx.registry.set_enabled("off.test", false).unwrap();
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let report = app
            .rollout(&fx.registry, &baseline(2, &[], None), true, &never)
            .unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.applied, vec!["a.test"]);
        assert_eq!(driver.calls_for(&fx.site_path("q.test")), 0);
        assert_eq!(driver.calls_for(&fx.site_path("off.test")), 0);
        assert_eq!(
            fx.registry.get("q.test").unwrap().quarantine_reason.as_deref(),
            Some("earlier failure")
        );
    }

    #[test]
    fn one_site_failure_does_not_touch_others() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        add_site(&fx.registry, "a.test");
        add_site(&fx.registry, "b.test");
        add_site(&fx.registry, "c.test");
        let driver = FakeDriver::new();
        driver.fail_activation(&fx.site_path("a.test"), "p1/p1.php");
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let report = app
            .rollout(&fx.registry, &baseline(2, &["p1"], None), true, &never)
            .unwrap();
        assert_eq!(report.applied, vec!["b.test", "c.test"]);
        assert_eq!(driver.active_plugins(&fx.site_path("b.test")), vec!["p1/p1.php"]);
    }

    #[test]
    fn unquarantine_retries_and_records_outcome() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        add_site(&fx.registry, "a.test");
        fx.registry.quarantine("a.test", "timeout").unwrap();
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);
        let b = baseline(4, &["p1"], None);

        let outcome = app.unquarantine(&fx.registry, &b, "a.test").unwrap();
        assert_eq!(
            outcome,
            SiteOutcome::Applied {
                domain: "a.test".into(),
                version: 4
            }
        );
        let site = fx.registry.get("a.test").unwrap();
        assert!(!site.is_quarantined);
        assert_eq!(site.baseline_version, 4);

        driver.fail_activation(&fx.site_path("a.test"), "p1/p1.php");
        let outcome = app.unquarantine(&fx.registry, &b, "a.test").unwrap();
        assert!(matches!(outcome, SiteOutcome::Quarantined { .. }));
        assert!(fx.registry.get("a.test").unwrap().is_quarantined);
    }

    #[test]
    fn applied_version_is_recorded_on_the_site() {
        let fx = Fixture::new();
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        app.apply_to_site(Path::new("/srv/a"), &baseline(7, &[], None)).unwrap();
        assert_eq!(
            driver.option("/srv/a", BASELINE_VERSION_OPTION),
            Some(serde_json::json!(7))
        );
    }

    #[test]
    fn registry_failure_mid_batch_still_clears_caches() {
        let fx = Fixture::new();
        install_plugin(fx.root(), "p1");
        add_site(&fx.registry, "a.test");
        add_site(&fx.registry, "b.test");
        add_site(&fx.registry, "c.test");
        fx.registry
            .execute_batch(
                "CREATE TRIGGER reject_b BEFORE UPDATE ON sites WHEN NEW.domain = 'b.test'
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);

        let err = app
            .rollout(&fx.registry, &baseline(2, &["p1"], None), true, &never)
            .unwrap_err();
        assert!(matches!(err, FleetError::Registry(_)), "{err}");
        assert_eq!(cache.clears(), 1);
        assert_eq!(fx.registry.get("a.test").unwrap().baseline_version, 2);
        assert_eq!(driver.calls_for(&fx.site_path("c.test")), 0);
    }

    #[test]
    fn unquarantine_unknown_site() {
        let fx = Fixture::new();
        let driver = FakeDriver::new();
        let cache = FakeCache::default();
        let app = BaselineApplicator::new(&fx.catalog, &driver, &cache);
        let err = app
            .unquarantine(&fx.registry, &baseline(1, &[], None), "nope.test")
            .unwrap_err();
        assert!(matches!(err, FleetError::SiteNotFound(_)));
    }
}
