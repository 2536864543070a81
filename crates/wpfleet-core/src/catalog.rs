//! Presence of plugins and themes in the shared `wp-content` tree.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::fetch::ArtifactKind;

/// Where a plugin's entry file may live, relative to the plugins directory,
/// in lookup order. The enforcer MU-plugin embeds the same list.
pub const PLUGIN_ENTRY_PATTERNS: &[&str] = &[
    "{slug}/{slug}.php",
    "{slug}/index.php",
    "{slug}/plugin.php",
    "{slug}.php",
];

/// Read-only view over `<shared_root>/wp-content`. Both the applicator and
/// `baseline validate` ask this one type whether an artifact is installed.
#[derive(Debug, Clone)]
pub struct ArtifactCatalog {
    root: PathBuf,
}

impl ArtifactCatalog {
    pub fn new(shared_root: &Path) -> Self {
        Self {
            root: shared_root.to_path_buf(),
        }
    }

    pub fn dir(&self, kind: ArtifactKind) -> PathBuf {
        kind.dir(&self.root)
    }

    pub fn exists(&self, kind: ArtifactKind, slug: &str) -> bool {
        if crate::paths::validate_slug(slug).is_err() {
            return false;
        }
        match kind {
            ArtifactKind::Plugin => self.plugin_entry_file(slug).is_some(),
            ArtifactKind::Theme => self.dir(kind).join(slug).is_dir(),
        }
    }

    /// Entry file relative to the plugins directory, as wp-cli expects it.
    /// First match of [`PLUGIN_ENTRY_PATTERNS`] wins.
    pub fn plugin_entry_file(&self, slug: &str) -> Option<String> {
        plugin_entry_in(&self.dir(ArtifactKind::Plugin), slug)
    }

    /// `Version:` from the plugin header, if readable.
    pub fn plugin_version(&self, slug: &str) -> Option<String> {
        let entry = self.plugin_entry_file(slug)?;
        let file = std::fs::File::open(self.dir(ArtifactKind::Plugin).join(entry)).ok()?;
        // WordPress only scans the first 8KB for headers; 2KB covers real plugins.
        let mut head = Vec::with_capacity(2048);
        file.take(2048).read_to_end(&mut head).ok()?;
        let text = String::from_utf8_lossy(&head);
        version_re()
            .captures(&text)
            .map(|c| c[1].to_string())
    }

    /// Installed slugs of `kind`, sorted.
    pub fn installed(&self, kind: ArtifactKind) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.dir(kind)) else {
            return Vec::new();
        };
        let mut slugs: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    return None;
                }
                let slug = match kind {
                    ArtifactKind::Plugin => name.strip_suffix(".php").unwrap_or(&name).to_string(),
                    ArtifactKind::Theme => name,
                };
                self.exists(kind, &slug).then_some(slug)
            })
            .collect();
        slugs.sort();
        slugs.dedup();
        slugs
    }
}

/// Entry file for `slug` inside any directory laid out like `wp-content/plugins`.
pub fn plugin_entry_in(plugins_dir: &Path, slug: &str) -> Option<String> {
    PLUGIN_ENTRY_PATTERNS
        .iter()
        .map(|pattern| pattern.replace("{slug}", slug))
        .find(|candidate| plugins_dir.join(candidate).is_file())
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[\s*#@/]*Version:\s*([0-9][0-9A-Za-z.\-]*)").unwrap())
}
