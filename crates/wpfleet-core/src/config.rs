use crate::error::{FleetError, Result};
use crate::fetch::{ArtifactSource, GitRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the operator config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wpfleet/config.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// GitHubSpec
// ---------------------------------------------------------------------------

/// A plugin or theme pulled from a GitHub repository.
///
/// When both `branch` and `tag` are set the tag wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubSpec {
    /// `owner/repo`
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl GitHubSpec {
    pub fn git_ref(&self) -> GitRef {
        match (&self.tag, &self.branch) {
            (Some(tag), _) => GitRef::Tag(tag.clone()),
            (None, Some(branch)) => GitRef::Branch(branch.clone()),
            (None, None) => GitRef::DefaultBranch,
        }
    }

    pub fn to_source(&self) -> ArtifactSource {
        ArtifactSource::GitHub {
            repo: self.repo.clone(),
            git_ref: self.git_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the shared core/plugins/themes tree.
    #[serde(default = "default_shared_root")]
    pub shared_root: PathBuf,
    /// SQLite file backing the fleet registry.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default = "default_keep_releases")]
    pub keep_releases: usize,
    #[serde(default = "default_php_version")]
    pub php_version: String,
    #[serde(default = "default_wp_locale")]
    pub wp_locale: String,
    /// WordPress.org plugin slugs seeded at `init`, in activation order.
    #[serde(default = "default_baseline_plugins")]
    pub baseline_plugins: Vec<String>,
    #[serde(default = "default_baseline_theme")]
    pub baseline_theme: Option<String>,
    /// Option defaults written into baseline v1.
    #[serde(default = "default_baseline_options")]
    pub baseline_options: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub github_plugins: BTreeMap<String, GitHubSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub github_themes: BTreeMap<String, GitHubSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub url_plugins: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub url_themes: BTreeMap<String, String>,
    /// wp-cli executable (name on PATH or absolute path).
    #[serde(default = "default_wp_bin")]
    pub wp_bin: String,
    #[serde(default = "default_wp_cli_timeout")]
    pub wp_cli_timeout_secs: u64,
    /// Shell command that clears FastCGI, object and opcode caches for every site at once.
    #[serde(default = "default_cache_clear_command")]
    pub cache_clear_command: String,
    /// HTTP probe timeout for canary checks during `update`.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_shared_root() -> PathBuf {
    PathBuf::from("/var/www/shared")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/wpfleet/registry.db")
}

fn default_keep_releases() -> usize {
    3
}

fn default_php_version() -> String {
    "8.3".to_string()
}

fn default_wp_locale() -> String {
    "en_US".to_string()
}

fn default_baseline_plugins() -> Vec<String> {
    vec!["nginx-helper".to_string(), "redis-cache".to_string()]
}

fn default_baseline_theme() -> Option<String> {
    Some("twentytwentyfour".to_string())
}

fn default_baseline_options() -> BTreeMap<String, serde_json::Value> {
    let mut m = BTreeMap::new();
    m.insert("blog_public".to_string(), serde_json::json!(1));
    m.insert(
        "default_comment_status".to_string(),
        serde_json::json!("closed"),
    );
    m.insert(
        "default_ping_status".to_string(),
        serde_json::json!("closed"),
    );
    m
}

fn default_wp_bin() -> String {
    "wp".to_string()
}

fn default_wp_cli_timeout() -> u64 {
    30
}

fn default_cache_clear_command() -> String {
    "wo clean --all".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shared_root: default_shared_root(),
            registry_path: default_registry_path(),
            keep_releases: default_keep_releases(),
            php_version: default_php_version(),
            wp_locale: default_wp_locale(),
            baseline_plugins: default_baseline_plugins(),
            baseline_theme: default_baseline_theme(),
            baseline_options: default_baseline_options(),
            github_plugins: BTreeMap::new(),
            github_themes: BTreeMap::new(),
            url_plugins: BTreeMap::new(),
            url_themes: BTreeMap::new(),
            wp_bin: default_wp_bin(),
            wp_cli_timeout_secs: default_wp_cli_timeout(),
            cache_clear_command: default_cache_clear_command(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Config {
    /// Load the config at `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn wp_cli_timeout(&self) -> Duration {
        Duration::from_secs(self.wp_cli_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// The full plugin list for baseline v1: WordPress.org slugs first, then
    /// GitHub and URL plugins, without duplicates.
    pub fn initial_plugins(&self) -> Vec<String> {
        let mut plugins: Vec<String> = Vec::new();
        let extra = self.github_plugins.keys().chain(self.url_plugins.keys());
        for slug in self.baseline_plugins.iter().chain(extra) {
            if !plugins.contains(slug) {
                plugins.push(slug.clone());
            }
        }
        plugins
    }

    /// Where a configured plugin comes from.
    pub fn plugin_source(&self, slug: &str) -> ArtifactSource {
        if let Some(gh) = self.github_plugins.get(slug) {
            return gh.to_source();
        }
        if let Some(url) = self.url_plugins.get(slug) {
            return ArtifactSource::Url(url.clone());
        }
        ArtifactSource::Registry
    }

    /// Where a configured theme comes from.
    pub fn theme_source(&self, slug: &str) -> ArtifactSource {
        if let Some(gh) = self.github_themes.get(slug) {
            return gh.to_source();
        }
        if let Some(url) = self.url_themes.get(slug) {
            return ArtifactSource::Url(url.clone());
        }
        ArtifactSource::Registry
    }

    /// Fail fast on settings that would make every workflow misbehave.
    pub fn require_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Config(errors.join("; ")))
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !self.shared_root.is_absolute() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "shared_root '{}' must be an absolute path",
                    self.shared_root.display()
                ),
            });
        }

        if self.keep_releases == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "keep_releases must be at least 1".to_string(),
            });
        }

        if self.wp_cli_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "wp_cli_timeout_secs must be greater than zero".to_string(),
            });
        }

        for slug in self.initial_plugins() {
            if crate::paths::validate_slug(&slug).is_err() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("invalid plugin slug '{slug}'"),
                });
            }
        }

        for (slug, gh) in self.github_plugins.iter().chain(self.github_themes.iter()) {
            if gh.repo.split('/').filter(|p| !p.is_empty()).count() != 2 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("'{slug}': repo '{}' is not owner/repo", gh.repo),
                });
            }
            if gh.branch.is_some() && gh.tag.is_some() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("'{slug}': both branch and tag set, tag wins"),
                });
            }
        }

        for (slug, url) in self.url_plugins.iter().chain(self.url_themes.iter()) {
            if !url.starts_with("https://") || !url.ends_with(".zip") {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("'{slug}': url '{url}' is not an https .zip link"),
                });
            }
        }

        if self.cache_clear_command.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "cache_clear_command is empty; caches will not be cleared".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(cfg.keep_releases, 3);
        assert_eq!(cfg.wp_cli_timeout_secs, 30);
        assert_eq!(cfg.baseline_theme.as_deref(), Some("twentytwentyfour"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "shared_root: /srv/shared\nkeep_releases: 5\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.shared_root, PathBuf::from("/srv/shared"));
        assert_eq!(cfg.keep_releases, 5);
        assert_eq!(cfg.wp_bin, "wp");
    }

    #[test]
    fn initial_plugins_dedupes_and_orders() {
        let mut cfg = Config::default();
        cfg.github_plugins.insert(
            "nginx-helper".to_string(),
            GitHubSpec {
                repo: "rtCamp/nginx-helper".to_string(),
                branch: Some("master".to_string()),
                tag: None,
            },
        );
        cfg.url_plugins
            .insert("zz-custom".to_string(), "https://example.com/zz.zip".to_string());
        assert_eq!(
            cfg.initial_plugins(),
            vec!["nginx-helper", "redis-cache", "zz-custom"]
        );
    }

    #[test]
    fn plugin_source_prefers_github_then_url() {
        let mut cfg = Config::default();
        cfg.github_plugins.insert(
            "gh".to_string(),
            GitHubSpec {
                repo: "o/r".to_string(),
                branch: Some("dev".to_string()),
                tag: Some("v1".to_string()),
            },
        );
        cfg.url_plugins
            .insert("zipped".to_string(), "https://x.test/z.zip".to_string());
        assert_eq!(
            cfg.plugin_source("gh"),
            ArtifactSource::GitHub {
                repo: "o/r".to_string(),
                git_ref: GitRef::Tag("v1".to_string())
            }
        );
        assert_eq!(
            cfg.plugin_source("zipped"),
            ArtifactSource::Url("https://x.test/z.zip".to_string())
        );
        assert_eq!(cfg.plugin_source("akismet"), ArtifactSource::Registry);
    }

    #[test]
    fn validate_flags_relative_root_and_zero_retention() {
        let cfg = Config {
            shared_root: PathBuf::from("relative/shared"),
            keep_releases: 0,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count(),
            2
        );
        assert!(cfg.require_valid().is_err());
    }

    #[test]
    fn validate_warns_on_non_zip_url() {
        let mut cfg = Config::default();
        cfg.url_plugins
            .insert("x".to_string(), "http://example.com/x.tar.gz".to_string());
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("'x'")));
        assert!(cfg.require_valid().is_ok());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_empty());
    }
}
