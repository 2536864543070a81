//! Read-only consistency checks over the shared tree, the baseline and the registry.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::applicator::QuarantinedSite;
use crate::baseline::{Baseline, BaselineStore};
use crate::catalog::ArtifactCatalog;
use crate::enforcer;
use crate::error::Result;
use crate::fetch::ArtifactKind;
use crate::paths;
use crate::registry::FleetRegistry;
use crate::release::ReleaseManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
}

/// Structural checks on the shared root.
pub fn health_checks(root: &Path, releases: &ReleaseManager) -> Vec<HealthCheck> {
    let check = |name: &str, ok: bool| HealthCheck {
        name: name.to_string(),
        ok,
    };
    let current = paths::current_link(root);
    let mut checks = vec![
        check("shared root exists", root.is_dir()),
        check("current symlink exists", current.symlink_metadata().is_ok()),
        check("plugins directory exists", paths::plugins_dir(root).is_dir()),
        check("themes directory exists", paths::themes_dir(root).is_dir()),
        check(
            "mu-plugins directory exists",
            root.join(paths::MU_PLUGINS_DIR).is_dir(),
        ),
        check("baseline document exists", paths::baseline_path(root).is_file()),
        check("baseline enforcer installed", enforcer::is_current(root)),
    ];
    if current.symlink_metadata().is_ok() {
        checks.push(check("current release valid", releases.current_is_valid()));
    }
    checks
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftedSite {
    pub domain: String,
    pub applied_version: u64,
}

/// Outcome of `baseline validate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaselineValidation {
    pub version: u64,
    pub history_head: Option<u64>,
    pub missing_plugins: Vec<String>,
    pub missing_theme: Option<String>,
    /// Header version of each installed baseline plugin.
    pub plugin_versions: BTreeMap<String, String>,
    /// Installed in the shared tree but not part of the baseline.
    pub unmanaged_plugins: Vec<String>,
    pub unmanaged_themes: Vec<String>,
    pub drifted: Vec<DriftedSite>,
    pub quarantined: Vec<QuarantinedSite>,
    pub staging: Option<String>,
    pub findings: Vec<Finding>,
}

impl BaselineValidation {
    /// No error-level findings. Drift and quarantine are warnings: they are
    /// the normal state between rollouts.
    pub fn is_valid(&self) -> bool {
        self.findings.iter().all(|f| f.severity != Severity::Error)
    }
}

/// Cross-check the baseline against installed artifacts and registry state.
pub fn validate_baseline(
    store: &BaselineStore,
    catalog: &ArtifactCatalog,
    registry: &FleetRegistry,
) -> Result<BaselineValidation> {
    let baseline = store.read()?;
    let history_head = store.history_head()?;
    let mut findings = Vec::new();

    let missing_plugins: Vec<String> = baseline
        .plugins
        .iter()
        .filter(|slug| !catalog.exists(ArtifactKind::Plugin, slug))
        .cloned()
        .collect();
    for slug in &missing_plugins {
        findings.push(error(format!("plugin '{slug}' is in the baseline but not installed")));
    }

    let missing_theme = baseline
        .theme
        .clone()
        .filter(|t| !catalog.exists(ArtifactKind::Theme, t));
    if let Some(theme) = &missing_theme {
        findings.push(error(format!("theme '{theme}' is in the baseline but not installed")));
    }

    let plugin_versions: BTreeMap<String, String> = baseline
        .plugins
        .iter()
        .filter_map(|slug| Some((slug.clone(), catalog.plugin_version(slug)?)))
        .collect();
    let unmanaged_plugins: Vec<String> = catalog
        .installed(ArtifactKind::Plugin)
        .into_iter()
        .filter(|slug| !baseline.has_plugin(slug))
        .collect();
    let unmanaged_themes: Vec<String> = catalog
        .installed(ArtifactKind::Theme)
        .into_iter()
        .filter(|slug| baseline.theme.as_deref() != Some(slug.as_str()))
        .collect();

    check_history(&baseline, history_head, &mut findings);

    let drifted: Vec<DriftedSite> = registry
        .drifted(baseline.version)?
        .into_iter()
        .filter(|s| !s.is_quarantined)
        .map(|s| DriftedSite {
            domain: s.domain,
            applied_version: s.baseline_version,
        })
        .collect();
    if !drifted.is_empty() {
        findings.push(warning(format!(
            "{} site(s) behind baseline v{}; run 'wpfleet baseline apply'",
            drifted.len(),
            baseline.version
        )));
    }

    let quarantined: Vec<QuarantinedSite> = registry
        .quarantined()?
        .into_iter()
        .map(|s| QuarantinedSite {
            domain: s.domain,
            reason: s.quarantine_reason.unwrap_or_default(),
        })
        .collect();
    for q in &quarantined {
        findings.push(warning(format!("{} is quarantined: {}", q.domain, q.reason)));
    }

    let staging = registry.staging_site()?.map(|s| s.domain);
    if staging.is_none() {
        findings.push(warning(
            "no staging site; rollouts will ask before touching production".to_string(),
        ));
    }

    Ok(BaselineValidation {
        version: baseline.version,
        history_head,
        missing_plugins,
        missing_theme,
        plugin_versions,
        unmanaged_plugins,
        unmanaged_themes,
        drifted,
        quarantined,
        staging,
        findings,
    })
}

fn check_history(baseline: &Baseline, head: Option<u64>, findings: &mut Vec<Finding>) {
    match head {
        None => findings.push(error("baseline history is empty".to_string())),
        Some(v) if v != baseline.version => findings.push(error(format!(
            "history ends at v{v} but the document is v{}",
            baseline.version
        ))),
        Some(_) => {}
    }
}

fn error(message: String) -> Finding {
    Finding {
        severity: Severity::Error,
        message,
    }
}

fn warning(message: String) -> Finding {
    Finding {
        severity: Severity::Warning,
        message,
    }
}
