//! Operator workflows, composed from the store, registry, releases and the
//! external collaborators.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::applicator::{BaselineApplicator, Confirm, RolloutReport, SiteOutcome};
use crate::baseline::{Baseline, BaselineStore, HistoryEntry, HistoryRef};
use crate::cache::{CacheController, ShellCacheController};
use crate::catalog::{plugin_entry_in, ArtifactCatalog};
use crate::config::Config;
use crate::enforcer;
use crate::error::{FleetError, Result};
use crate::fetch::{ArtifactFetcher, ArtifactKind, ArtifactSource, HttpFetcher};
use crate::git::GitCommit;
use crate::paths;
use crate::probe::{HttpProbe, SiteProbe};
use crate::registry::{FleetRegistry, FleetStats, NewSite, TenantSite, META_CURRENT_RELEASE};
use crate::release::ReleaseManager;
use crate::runtime::{PluginStatus, SiteRuntimeDriver, WpCli};
use crate::validate::{self, BaselineValidation, HealthCheck};

/// The external world, borrowed for the lifetime of a [`Fleet`].
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub fetcher: &'a dyn ArtifactFetcher,
    pub driver: &'a dyn SiteRuntimeDriver,
    pub cache: &'a dyn CacheController,
    pub probe: &'a dyn SiteProbe,
}

/// Production implementations built from config.
pub struct Services {
    pub fetcher: HttpFetcher,
    pub driver: WpCli,
    pub cache: ShellCacheController,
    pub probe: HttpProbe,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.wp_cli_timeout();
        Ok(Self {
            fetcher: HttpFetcher::new(&config.wp_bin, &config.wp_locale, timeout)?,
            driver: WpCli::new(&config.wp_bin, timeout),
            cache: ShellCacheController::new(
                &config.cache_clear_command,
                timeout.max(Duration::from_secs(60)),
            ),
            probe: HttpProbe::new(config.probe_timeout())?,
        })
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            fetcher: &self.fetcher,
            driver: &self.driver,
            cache: &self.cache,
            probe: &self.probe,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub release: String,
    pub downloaded_release: bool,
    pub baseline_version: u64,
    pub plugins: Vec<String>,
    pub theme: Option<String>,
    /// Artifacts from config that could not be fetched and were left out.
    pub skipped: Vec<String>,
    /// The enforcer MU-plugin written into the shared `mu-plugins` directory.
    pub enforcer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanaryResult {
    pub domain: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub release: String,
    pub previous: Option<String>,
    pub canary: Option<CanaryResult>,
    pub removed_releases: Vec<String>,
    pub cache_cleared: bool,
    pub sites_updated: usize,
    /// Config-declared plugins and themes downloaded again.
    pub refreshed: Vec<String>,
    /// Artifacts whose download failed; the installed copy was kept.
    pub refresh_failed: Vec<String>,
    /// Baseline version written after the update, so sites re-converge.
    pub baseline_version: u64,
}

/// A site's live plugin list measured against the baseline.
#[derive(Debug, Clone, Serialize)]
pub struct SitePlugins {
    pub domain: String,
    pub baseline_version: u64,
    pub plugins: Vec<PluginStatus>,
    /// Baseline plugins the site does not report as active.
    pub inactive_baseline: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub from: String,
    pub to: String,
    pub cache_cleared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseInfo {
    pub id: String,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub initialized: bool,
    pub shared_root: String,
    pub current_release: Option<String>,
    pub baseline: Option<Baseline>,
    pub releases: Vec<ReleaseInfo>,
    pub stats: FleetStats,
    pub health: Vec<HealthCheck>,
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

pub struct Fleet<'a> {
    config: Config,
    store: BaselineStore,
    registry: FleetRegistry,
    releases: ReleaseManager,
    catalog: ArtifactCatalog,
    with: Collaborators<'a>,
}

impl<'a> Fleet<'a> {
    pub fn new(config: Config, registry: FleetRegistry, with: Collaborators<'a>) -> Self {
        let root = config.shared_root.clone();
        Self {
            store: BaselineStore::open(&root).with_git_mirror(),
            releases: ReleaseManager::new(&root),
            catalog: ArtifactCatalog::new(&root),
            config,
            registry,
            with,
        }
    }

    /// Open the registry named in `config`.
    pub fn open(config: Config, with: Collaborators<'a>) -> Result<Self> {
        config.require_valid()?;
        let registry = FleetRegistry::open(&config.registry_path)?;
        Ok(Self::new(config, registry, with))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &BaselineStore {
        &self.store
    }

    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }

    pub fn releases(&self) -> &ReleaseManager {
        &self.releases
    }

    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    fn applicator(&self) -> BaselineApplicator<'_> {
        BaselineApplicator::new(&self.catalog, self.with.driver, self.with.cache)
    }

    fn require_initialized(&self) -> Result<()> {
        if !self.registry.is_initialized()? || !self.store.exists() {
            return Err(FleetError::NotInitialized);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Infrastructure
    // -----------------------------------------------------------------------

    /// Lay out the shared root, download the first core release, seed the
    /// configured plugins and theme, and write baseline v1.
    pub fn init(&self, force: bool) -> Result<InitReport> {
        self.config.require_valid()?;
        if self.registry.is_initialized()? && !force {
            return Err(FleetError::AlreadyInitialized);
        }
        let root = &self.config.shared_root;
        for dir in paths::SHARED_DIRS {
            crate::io::ensure_dir(&root.join(dir))?;
        }

        let (release, downloaded_release) = match self.releases.current()? {
            Some(id) if self.releases.current_is_valid() => {
                info!(release = %id, "keeping existing core release");
                (id, false)
            }
            _ => (self.install_release()?, true),
        };
        self.releases.activate(&release)?;

        let mut skipped = Vec::new();
        let mut plugins = Vec::new();
        for slug in self.config.initial_plugins() {
            let source = self.config.plugin_source(&slug);
            match self.fetch_artifact(ArtifactKind::Plugin, &slug, &source) {
                Ok(()) => plugins.push(slug),
                Err(e) => {
                    warn!(plugin = %slug, error = %e, "could not seed plugin, leaving it out of the baseline");
                    skipped.push(slug);
                }
            }
        }
        let theme = match &self.config.baseline_theme {
            Some(slug) => {
                let source = self.config.theme_source(slug);
                match self.fetch_artifact(ArtifactKind::Theme, slug, &source) {
                    Ok(()) => Some(slug.clone()),
                    Err(e) => {
                        warn!(theme = %slug, error = %e, "could not seed theme, baseline has no theme");
                        skipped.push(slug.clone());
                        None
                    }
                }
            }
            None => None,
        };

        let baseline = self.store.create(
            Baseline::initial(plugins, theme, self.config.baseline_options.clone()),
            force,
        )?;
        let enforcer = enforcer::install(root)?;
        self.registry.set_meta(META_CURRENT_RELEASE, &release)?;
        self.registry.mark_initialized()?;
        info!(release = %release, version = baseline.version, "fleet initialized");

        Ok(InitReport {
            release,
            downloaded_release,
            baseline_version: baseline.version,
            plugins: baseline.plugins,
            theme: baseline.theme,
            skipped,
            enforcer: enforcer.display().to_string(),
        })
    }

    /// Download and verify a new core release. Nothing is activated; a
    /// failed download leaves no directory behind.
    fn install_release(&self) -> Result<String> {
        let id = self.releases.allocate_id(Utc::now());
        let dir = self.releases.release_path(&id);
        let result = self
            .with
            .fetcher
            .fetch_core(&dir)
            .and_then(|()| self.with.fetcher.verify_core(&dir));
        if let Err(e) = result {
            if let Err(rm) = std::fs::remove_dir_all(&dir) {
                warn!(release = %id, error = %rm, "could not remove failed release");
            }
            return Err(e);
        }
        info!(release = %id, "installed core release");
        Ok(id)
    }

    /// Roll the fleet onto a freshly downloaded core release, guarded by an
    /// HTTP probe of the canary site.
    pub fn update(&self, force: bool) -> Result<UpdateReport> {
        self.require_initialized()?;
        let previous = self.releases.current()?;
        let release = self.install_release()?;

        self.releases.record_backup()?;
        self.releases.activate(&release)?;

        let canary = match self.canary_site()? {
            Some(site) => {
                let result = self.with.probe.probe(&site.domain, site.is_ssl);
                let outcome = CanaryResult {
                    domain: site.domain.clone(),
                    passed: result.is_ok(),
                    detail: match &result {
                        Ok(status) => format!("HTTP {status}"),
                        Err(e) => e.to_string(),
                    },
                };
                if let Err(e) = result {
                    if !force {
                        if let Some(prev) = &previous {
                            self.releases.activate(prev)?;
                            warn!(release = %release, restored = %prev, "canary failed, switched back");
                            self.with.cache.clear_all_caches();
                            if let Err(rm) = self.releases.remove(&release) {
                                warn!(release = %release, error = %rm, "could not remove rejected release");
                            }
                        }
                        return Err(match e {
                            err @ FleetError::CanaryFailed { .. } => err,
                            other => FleetError::CanaryFailed {
                                domain: site.domain,
                                reason: other.to_string(),
                            },
                        });
                    }
                    warn!(domain = %site.domain, error = %e, "canary failed, continuing because of --force");
                }
                Some(outcome)
            }
            None => {
                warn!("no site to probe, release activated without a canary check");
                None
            }
        };

        let (refreshed, refresh_failed) = self.refresh_artifacts();
        let cache_cleared = self.with.cache.clear_all_caches();
        let removed_releases = self.releases.retain(self.config.keep_releases)?;
        self.registry.set_meta(META_CURRENT_RELEASE, &release)?;
        let sites_updated = self.registry.set_release_for_all(&release)?;
        let baseline = self.store.mutate(&format!("core update {release}"), Ok)?;
        info!(release = %release, sites = sites_updated, baseline = baseline.version, "core updated");

        Ok(UpdateReport {
            release,
            previous,
            canary,
            removed_releases,
            cache_cleared,
            sites_updated,
            refreshed,
            refresh_failed,
            baseline_version: baseline.version,
        })
    }

    /// Download the config-declared plugins and theme again. Failures are
    /// logged and leave the installed copy untouched.
    fn refresh_artifacts(&self) -> (Vec<String>, Vec<String>) {
        let plugins = self.config.initial_plugins().into_iter().map(|slug| {
            let source = self.config.plugin_source(&slug);
            (ArtifactKind::Plugin, slug, source)
        });
        let theme = self.config.baseline_theme.iter().map(|slug| {
            (ArtifactKind::Theme, slug.clone(), self.config.theme_source(slug))
        });
        let mut refreshed = Vec::new();
        let mut failed = Vec::new();
        for (kind, slug, source) in plugins.chain(theme) {
            match self.refresh_artifact(kind, &slug, &source) {
                Ok(()) => refreshed.push(slug),
                Err(e) => {
                    warn!(%kind, slug = %slug, error = %e, "refresh failed, keeping installed copy");
                    failed.push(slug);
                }
            }
        }
        (refreshed, failed)
    }

    /// Fetch into a hidden directory beside the installed copy, then swap by
    /// rename. The old copy is dropped with the temp directory.
    fn refresh_artifact(&self, kind: ArtifactKind, slug: &str, source: &ArtifactSource) -> Result<()> {
        paths::validate_slug(slug)?;
        let dir = self.catalog.dir(kind);
        crate::io::ensure_dir(&dir)?;
        let scratch = tempfile::Builder::new()
            .prefix(".wpfleet-refresh-")
            .tempdir_in(&dir)?;
        let fetched = self.with.fetcher.fetch(kind, slug, source, scratch.path())?;
        let complete = match kind {
            ArtifactKind::Plugin => plugin_entry_in(scratch.path(), slug).is_some(),
            ArtifactKind::Theme => scratch.path().join(slug).is_dir(),
        };
        let Some(name) = fetched.file_name().filter(|_| complete) else {
            return Err(FleetError::ArtifactMissing {
                kind: kind.to_string(),
                slug: slug.to_string(),
            });
        };
        let target = dir.join(name);
        let old = scratch.path().join(".old");
        let had_old = target.symlink_metadata().is_ok();
        if had_old {
            std::fs::rename(&target, &old)?;
        }
        if let Err(e) = std::fs::rename(&fetched, &target) {
            if had_old {
                std::fs::rename(&old, &target)?;
            }
            return Err(e.into());
        }
        info!(%kind, slug = %slug, "refreshed artifact");
        Ok(())
    }

    /// Staging site when designated, else the first enabled healthy site.
    fn canary_site(&self) -> Result<Option<TenantSite>> {
        if let Some(site) = self.registry.staging_site()? {
            return Ok(Some(site));
        }
        Ok(self
            .registry
            .list()?
            .into_iter()
            .find(|s| s.is_enabled && !s.is_quarantined))
    }

    /// Switch `current` back to the release before it.
    pub fn rollback(&self, force: bool, confirm: &dyn Confirm) -> Result<RollbackReport> {
        self.require_initialized()?;
        let from = self.releases.current()?.ok_or(FleetError::NoPreviousRelease)?;
        let to = self
            .releases
            .previous(&from)?
            .ok_or(FleetError::NoPreviousRelease)?;
        if !force && !confirm.confirm(&format!("Roll back core from {from} to {to}?")) {
            return Err(FleetError::Aborted);
        }
        self.releases.record_backup()?;
        self.releases.activate(&to)?;
        let cache_cleared = self.with.cache.clear_all_caches();
        self.registry.set_meta(META_CURRENT_RELEASE, &to)?;
        self.registry.set_release_for_all(&to)?;
        info!(from = %from, to = %to, "rolled back core release");
        Ok(RollbackReport {
            from,
            to,
            cache_cleared,
        })
    }

    pub fn list_releases(&self) -> Result<Vec<ReleaseInfo>> {
        let current = self.releases.current()?;
        Ok(self
            .releases
            .list()?
            .into_iter()
            .map(|id| ReleaseInfo {
                current: current.as_deref() == Some(id.as_str()),
                id,
            })
            .collect())
    }

    pub fn status(&self) -> Result<FleetStatus> {
        let initialized = self.registry.is_initialized()?;
        let baseline = if self.store.exists() {
            Some(self.store.read()?)
        } else {
            None
        };
        Ok(FleetStatus {
            initialized,
            shared_root: self.config.shared_root.display().to_string(),
            current_release: self.releases.current()?,
            baseline,
            releases: self.list_releases()?,
            stats: self.registry.stats()?,
            health: validate::health_checks(&self.config.shared_root, &self.releases),
        })
    }

    // -----------------------------------------------------------------------
    // Baseline
    // -----------------------------------------------------------------------

    pub fn baseline(&self) -> Result<Baseline> {
        self.require_initialized()?;
        self.store.read()
    }

    fn fetch_artifact(&self, kind: ArtifactKind, slug: &str, source: &ArtifactSource) -> Result<()> {
        let dir = self.catalog.dir(kind);
        let fetched = self.with.fetcher.fetch(kind, slug, source, &dir)?;
        if !self.catalog.exists(kind, slug) {
            // An unusable download would otherwise satisfy every later fetch.
            if fetched.starts_with(&dir) && fetched.symlink_metadata().is_ok() {
                let removed = if fetched.is_dir() {
                    std::fs::remove_dir_all(&fetched)
                } else {
                    std::fs::remove_file(&fetched)
                };
                match removed {
                    Ok(()) => warn!(path = %fetched.display(), "removed incomplete artifact"),
                    Err(e) => warn!(path = %fetched.display(), error = %e, "could not remove incomplete artifact"),
                }
            }
            return Err(FleetError::ArtifactMissing {
                kind: kind.to_string(),
                slug: slug.to_string(),
            });
        }
        Ok(())
    }

    /// Fetch a plugin (from `source`, or wherever config says) and append it
    /// to the baseline.
    pub fn add_plugin(&self, slug: &str, source: Option<ArtifactSource>) -> Result<Baseline> {
        self.require_initialized()?;
        paths::validate_slug(slug)?;
        if self.store.read()?.has_plugin(slug) {
            return Err(FleetError::PluginExists(slug.to_string()));
        }
        let source = source.unwrap_or_else(|| self.config.plugin_source(slug));
        self.fetch_artifact(ArtifactKind::Plugin, slug, &source)?;
        self.store.mutate(&format!("add plugin {slug}"), |mut b| {
            b.add_plugin(slug)?;
            Ok(b)
        })
    }

    pub fn remove_plugin(&self, slug: &str) -> Result<Baseline> {
        self.require_initialized()?;
        self.store.mutate(&format!("remove plugin {slug}"), |mut b| {
            b.remove_plugin(slug)?;
            Ok(b)
        })
    }

    /// Fetch a theme and make it the baseline theme.
    pub fn add_theme(&self, slug: &str, source: Option<ArtifactSource>) -> Result<Baseline> {
        self.require_initialized()?;
        paths::validate_slug(slug)?;
        let source = source.unwrap_or_else(|| self.config.theme_source(slug));
        self.fetch_artifact(ArtifactKind::Theme, slug, &source)?;
        self.store.mutate(&format!("add theme {slug}"), |mut b| {
            b.set_theme(Some(slug))?;
            Ok(b)
        })
    }

    /// Make an already installed theme the baseline theme.
    pub fn set_theme(&self, slug: &str) -> Result<Baseline> {
        self.require_initialized()?;
        paths::validate_slug(slug)?;
        if !self.catalog.exists(ArtifactKind::Theme, slug) {
            return Err(FleetError::ArtifactMissing {
                kind: ArtifactKind::Theme.to_string(),
                slug: slug.to_string(),
            });
        }
        self.store.mutate(&format!("set theme {slug}"), |mut b| {
            b.set_theme(Some(slug))?;
            Ok(b)
        })
    }

    /// Roll the current baseline out across the fleet.
    pub fn apply(&self, force: bool, confirm: &dyn Confirm) -> Result<RolloutReport> {
        self.require_initialized()?;
        let baseline = self.store.read()?;
        self.applicator()
            .rollout(&self.registry, &baseline, force, confirm)
    }

    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.require_initialized()?;
        self.store.history(limit)?.collect()
    }

    /// Baseline commits from the git mirror, newest first. Empty without git.
    pub fn git_log(&self, limit: usize) -> Result<Vec<GitCommit>> {
        match self.store.git() {
            Some(git) => git.log(limit),
            None => Ok(Vec::new()),
        }
    }

    /// Restore an earlier baseline as a new version.
    pub fn baseline_rollback(&self, target: &HistoryRef) -> Result<Baseline> {
        self.require_initialized()?;
        self.store.revert_to(target)
    }

    pub fn validate(&self) -> Result<BaselineValidation> {
        self.require_initialized()?;
        validate::validate_baseline(&self.store, &self.catalog, &self.registry)
    }

    // -----------------------------------------------------------------------
    // Sites
    // -----------------------------------------------------------------------

    pub fn unquarantine(&self, domain: &str) -> Result<SiteOutcome> {
        self.require_initialized()?;
        let domain = paths::normalize_domain(domain)?;
        let baseline = self.store.read()?;
        self.applicator()
            .unquarantine(&self.registry, &baseline, &domain)
    }

    /// Returns the domain that was staging before, if it changed.
    pub fn set_staging(&self, domain: &str) -> Result<Option<String>> {
        let domain = paths::normalize_domain(domain)?;
        let previous = self.registry.set_staging(&domain)?;
        info!(domain = %domain, previous = ?previous, "staging site set");
        Ok(previous)
    }

    pub fn unset_staging(&self, domain: &str) -> Result<()> {
        let domain = paths::normalize_domain(domain)?;
        self.registry.clear_staging(&domain)?;
        info!(domain = %domain, "staging flag cleared");
        Ok(())
    }

    /// Add a provisioned site to the registry. It joins at baseline version
    /// 0 and converges on the next apply.
    pub fn register_site(&self, mut site: NewSite) -> Result<TenantSite> {
        site.domain = paths::normalize_domain(&site.domain)?;
        if !std::path::Path::new(&site.site_path).is_absolute() {
            return Err(FleetError::Config(format!(
                "site path '{}' must be absolute",
                site.site_path
            )));
        }
        if site.shared_release.is_none() {
            site.shared_release = self.releases.current()?;
        }
        let registered = self.registry.register(&site)?;
        info!(domain = %registered.domain, "site registered");
        Ok(registered)
    }

    pub fn remove_site(&self, domain: &str) -> Result<()> {
        let domain = paths::normalize_domain(domain)?;
        self.registry.remove(&domain)?;
        info!(domain = %domain, "site removed from registry");
        Ok(())
    }

    pub fn set_site_enabled(&self, domain: &str, enabled: bool) -> Result<()> {
        let domain = paths::normalize_domain(domain)?;
        self.registry.set_enabled(&domain, enabled)
    }

    pub fn sites(&self) -> Result<Vec<TenantSite>> {
        self.registry.list()
    }

    /// Ask the site which plugins it has active. Read-only.
    pub fn site_plugins(&self, domain: &str) -> Result<SitePlugins> {
        self.require_initialized()?;
        let domain = paths::normalize_domain(domain)?;
        let site = self.registry.get(&domain)?;
        let baseline = self.store.read()?;
        let plugins = self
            .with
            .driver
            .list_plugins(std::path::Path::new(&site.site_path))?;
        let inactive_baseline = baseline
            .plugins
            .iter()
            .filter(|slug| !plugins.iter().any(|p| p.name == **slug && p.is_active()))
            .cloned()
            .collect();
        Ok(SitePlugins {
            domain,
            baseline_version: baseline.version,
            plugins,
            inactive_baseline,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
