//! In-memory collaborators for exercising rollouts without wp-cli or network.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;

use crate::cache::CacheController;
use crate::catalog::ArtifactCatalog;
use crate::error::{FleetError, Result};
use crate::fetch::{check_core_markers, ArtifactFetcher, ArtifactKind, ArtifactSource, CORE_MARKERS};
use crate::probe::{check_status, SiteProbe};
use crate::registry::{FleetRegistry, NewSite, TenantSite};
use crate::runtime::{PluginStatus, SiteRuntimeDriver};

pub struct Fixture {
    pub dir: TempDir,
    pub catalog: ArtifactCatalog,
    pub registry: FleetRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = ArtifactCatalog::new(dir.path());
        Self {
            dir,
            catalog,
            registry: FleetRegistry::open_in_memory().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn site_path(&self, domain: &str) -> String {
        site_path(domain)
    }
}

fn site_path(domain: &str) -> String {
    format!("/srv/{domain}/htdocs")
}

pub fn add_site(registry: &FleetRegistry, domain: &str) -> TenantSite {
    registry
        .register(&NewSite {
            domain: domain.to_string(),
            site_path: site_path(domain),
            php_version: "8.3".to_string(),
            cache_type: "wpfc".to_string(),
            is_ssl: true,
            shared_release: None,
        })
        .unwrap()
}

pub fn install_plugin(root: &Path, slug: &str) -> PathBuf {
    write_plugin(&ArtifactKind::Plugin.dir(root), slug, "1.0.0")
}

pub fn install_theme(root: &Path, slug: &str) -> PathBuf {
    write_theme(&ArtifactKind::Theme.dir(root), slug)
}

pub fn write_plugin(plugins_dir: &Path, slug: &str, version: &str) -> PathBuf {
    let dir = plugins_dir.join(slug);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{slug}.php")),
        format!("<?php\n/*\n * Plugin Name: {slug}\n * Version: {version}\n */\n"),
    )
    .unwrap();
    dir
}

fn write_theme(themes_dir: &Path, slug: &str) -> PathBuf {
    let dir = themes_dir.join(slug);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("style.css"), format!("/* Theme Name: {slug} */")).unwrap();
    dir
}

// ---------------------------------------------------------------------------
// FakeDriver
// ---------------------------------------------------------------------------

/// Live state of one fake site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteState {
    pub options: BTreeMap<String, Value>,
    pub theme: Option<String>,
}

#[derive(Default)]
pub struct FakeDriver {
    sites: RefCell<HashMap<String, SiteState>>,
    calls: RefCell<HashMap<String, usize>>,
    failing_activations: RefCell<HashSet<(String, String)>>,
    failing_themes: RefCell<HashSet<String>>,
    unreachable: RefCell<HashSet<String>>,
}

fn key(site_path: &Path) -> String {
    site_path.to_string_lossy().into_owned()
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_activation(&self, site: &str, entry: &str) {
        self.failing_activations
            .borrow_mut()
            .insert((site.to_string(), entry.to_string()));
    }

    pub fn fail_theme(&self, site: &str) {
        self.failing_themes.borrow_mut().insert(site.to_string());
    }

    pub fn unreachable(&self, site: &str) {
        self.unreachable.borrow_mut().insert(site.to_string());
    }

    pub fn seed_plugins(&self, site: &str, entries: &[&str]) {
        self.seed_option(site, "active_plugins", serde_json::json!(entries));
    }

    pub fn seed_option(&self, site: &str, name: &str, value: Value) {
        self.with_site(site, |s| {
            s.options.insert(name.to_string(), value);
        });
    }

    pub fn state(&self, site: &str) -> SiteState {
        self.sites.borrow().get(site).cloned().unwrap_or_default()
    }

    pub fn option(&self, site: &str, name: &str) -> Option<Value> {
        self.state(site).options.get(name).cloned()
    }

    pub fn active_plugins(&self, site: &str) -> Vec<String> {
        match self.option(site, "active_plugins") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn theme(&self, site: &str) -> Option<String> {
        self.state(site).theme
    }

    pub fn calls_for(&self, site: &str) -> usize {
        self.calls.borrow().get(site).copied().unwrap_or(0)
    }

    fn with_site<T>(&self, site: &str, f: impl FnOnce(&mut SiteState) -> T) -> T {
        let mut sites = self.sites.borrow_mut();
        let state = sites.entry(site.to_string()).or_insert_with(|| SiteState {
            options: BTreeMap::from([("active_plugins".to_string(), Value::Array(Vec::new()))]),
            theme: None,
        });
        f(state)
    }

    fn enter(&self, site_path: &Path) -> Result<String> {
        let site = key(site_path);
        *self.calls.borrow_mut().entry(site.clone()).or_default() += 1;
        if self.unreachable.borrow().contains(&site) {
            return Err(FleetError::Runtime("wp timed out after 30s".to_string()));
        }
        Ok(site)
    }
}

impl SiteRuntimeDriver for FakeDriver {
    fn get_option(&self, site_path: &Path, name: &str) -> Result<Option<Value>> {
        let site = self.enter(site_path)?;
        Ok(self.with_site(&site, |s| s.options.get(name).cloned()))
    }

    fn set_option(&self, site_path: &Path, name: &str, value: &Value) -> Result<()> {
        let site = self.enter(site_path)?;
        self.with_site(&site, |s| {
            s.options.insert(name.to_string(), value.clone());
        });
        Ok(())
    }

    fn activate_plugin(&self, site_path: &Path, entry_file: &str) -> Result<()> {
        let site = self.enter(site_path)?;
        if self
            .failing_activations
            .borrow()
            .contains(&(site.clone(), entry_file.to_string()))
        {
            return Err(FleetError::Runtime(format!(
                "Plugin '{entry_file}' could not be activated"
            )));
        }
        self.with_site(&site, |s| {
            let list = s
                .options
                .entry("active_plugins".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = list {
                let entry = Value::String(entry_file.to_string());
                if !items.contains(&entry) {
                    items.push(entry);
                }
            }
        });
        Ok(())
    }

    fn activate_theme(&self, site_path: &Path, theme: &str) -> Result<()> {
        let site = self.enter(site_path)?;
        if self.failing_themes.borrow().contains(&site) {
            return Err(FleetError::Runtime(format!(
                "The '{theme}' theme could not be found"
            )));
        }
        self.with_site(&site, |s| s.theme = Some(theme.to_string()));
        Ok(())
    }

    /// Only active plugins are known to the fake; names come from entry files.
    fn list_plugins(&self, site_path: &Path) -> Result<Vec<PluginStatus>> {
        let site = self.enter(site_path)?;
        Ok(self
            .active_plugins(&site)
            .into_iter()
            .map(|entry| PluginStatus {
                name: entry
                    .split('/')
                    .next()
                    .unwrap_or(&entry)
                    .trim_end_matches(".php")
                    .to_string(),
                status: "active".to_string(),
                version: String::new(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// FakeCache / FakeFetcher / FakeProbe
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeCache {
    clears: Cell<usize>,
}

impl FakeCache {
    pub fn clears(&self) -> usize {
        self.clears.get()
    }
}

impl CacheController for FakeCache {
    fn clear_all_caches(&self) -> bool {
        self.clears.set(self.clears.get() + 1);
        true
    }
}

/// Materializes artifacts on disk instead of downloading them.
#[derive(Default)]
pub struct FakeFetcher {
    pub fetched: RefCell<Vec<(ArtifactKind, String, ArtifactSource)>>,
    pub core_downloads: Cell<usize>,
    missing: RefCell<HashSet<String>>,
    hollow: RefCell<HashSet<String>>,
    broken_core: Cell<bool>,
    plugin_version: RefCell<String>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetching `slug` reports not found.
    pub fn missing(&self, slug: &str) {
        self.missing.borrow_mut().insert(slug.to_string());
    }

    /// The next fetch of `slug` unpacks a directory with no entry file.
    pub fn hollow(&self, slug: &str) {
        self.hollow.borrow_mut().insert(slug.to_string());
    }

    /// Header version written into plugins fetched from now on.
    pub fn serve_version(&self, version: &str) {
        *self.plugin_version.borrow_mut() = version.to_string();
    }

    /// Core downloads come back incomplete.
    pub fn break_core(&self) {
        self.broken_core.set(true);
    }

    pub fn fetched_slugs(&self) -> Vec<String> {
        self.fetched.borrow().iter().map(|(_, s, _)| s.clone()).collect()
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn fetch(
        &self,
        kind: ArtifactKind,
        slug: &str,
        source: &ArtifactSource,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        crate::paths::validate_slug(slug)?;
        let dest = target_dir.join(slug);
        if dest.exists() {
            return Ok(dest);
        }
        if self.missing.borrow().contains(slug) {
            return Err(FleetError::FetchFailed {
                source_desc: source.to_string(),
                reason: format!("{kind} '{slug}' not found"),
            });
        }
        self.fetched
            .borrow_mut()
            .push((kind, slug.to_string(), source.clone()));
        if self.hollow.borrow_mut().remove(slug) {
            std::fs::create_dir_all(dest.join("docs"))?;
            return Ok(dest);
        }
        let version = match self.plugin_version.borrow().as_str() {
            "" => "1.0.0".to_string(),
            v => v.to_string(),
        };
        Ok(match kind {
            ArtifactKind::Plugin => write_plugin(target_dir, slug, &version),
            ArtifactKind::Theme => write_theme(target_dir, slug),
        })
    }

    fn fetch_core(&self, release_dir: &Path) -> Result<()> {
        self.core_downloads.set(self.core_downloads.get() + 1);
        std::fs::create_dir_all(release_dir)?;
        if self.broken_core.get() {
            return Ok(());
        }
        for marker in CORE_MARKERS {
            let path = release_dir.join(marker);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, "<?php\n")?;
        }
        Ok(())
    }

    fn verify_core(&self, release_dir: &Path) -> Result<()> {
        check_core_markers(release_dir)
    }
}

/// Answers 200 unless told otherwise.
#[derive(Default)]
pub struct FakeProbe {
    statuses: RefCell<HashMap<String, u16>>,
    pub probed: RefCell<Vec<String>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, domain: &str, status: u16) {
        self.statuses.borrow_mut().insert(domain.to_string(), status);
    }
}

impl SiteProbe for FakeProbe {
    fn probe(&self, domain: &str, _ssl: bool) -> Result<u16> {
        self.probed.borrow_mut().push(domain.to_string());
        let status = self.statuses.borrow().get(domain).copied().unwrap_or(200);
        check_status(domain, status)
    }
}
