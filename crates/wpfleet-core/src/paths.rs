use crate::error::{FleetError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Layout under the shared root
// ---------------------------------------------------------------------------

pub const RELEASES_DIR: &str = "releases";
pub const CURRENT_LINK: &str = "current";
pub const WP_CONTENT_DIR: &str = "wp-content";
pub const PLUGINS_DIR: &str = "wp-content/plugins";
pub const THEMES_DIR: &str = "wp-content/themes";
pub const MU_PLUGINS_DIR: &str = "wp-content/mu-plugins";
pub const LANGUAGES_DIR: &str = "wp-content/languages";
pub const CONFIG_DIR: &str = "config";
pub const BACKUPS_DIR: &str = "backups";

pub const BASELINE_FILE: &str = "config/baseline.json";
pub const HISTORY_FILE: &str = "config/baseline.history.jsonl";
pub const LOCK_FILE: &str = "config/baseline.lock";

pub const RELEASE_PREFIX: &str = "wp-";

/// Every directory `init` creates, relative to the shared root.
pub const SHARED_DIRS: &[&str] = &[
    RELEASES_DIR,
    WP_CONTENT_DIR,
    PLUGINS_DIR,
    THEMES_DIR,
    MU_PLUGINS_DIR,
    LANGUAGES_DIR,
    "wp-content/languages/plugins",
    "wp-content/languages/themes",
    CONFIG_DIR,
    BACKUPS_DIR,
];

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn baseline_path(root: &Path) -> PathBuf {
    root.join(BASELINE_FILE)
}

pub fn history_path(root: &Path) -> PathBuf {
    root.join(HISTORY_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn releases_dir(root: &Path) -> PathBuf {
    root.join(RELEASES_DIR)
}

pub fn release_dir(root: &Path, release: &str) -> PathBuf {
    releases_dir(root).join(release)
}

pub fn current_link(root: &Path) -> PathBuf {
    root.join(CURRENT_LINK)
}

pub fn plugins_dir(root: &Path) -> PathBuf {
    root.join(PLUGINS_DIR)
}

pub fn themes_dir(root: &Path) -> PathBuf {
    root.join(THEMES_DIR)
}

pub fn mu_plugins_dir(root: &Path) -> PathBuf {
    root.join(MU_PLUGINS_DIR)
}

pub fn backups_dir(root: &Path) -> PathBuf {
    root.join(BACKUPS_DIR)
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();
static DOMAIN_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    // WordPress.org slugs are lowercase; GitHub-sourced ones sometimes carry dots or underscores.
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._\-]*$").unwrap())
}

fn domain_re() -> &'static Regex {
    DOMAIN_RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z0-9][a-z0-9\-]{0,61}[a-z0-9]$")
            .unwrap()
    })
}

/// Validate a plugin or theme slug before it is used to build a path.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug.len() > 128 || !slug_re().is_match(slug) || slug.contains("..") {
        return Err(FleetError::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

/// Normalize and validate a site domain: lowercased, scheme and trailing
/// slash stripped, `www.` kept as given.
pub fn normalize_domain(raw: &str) -> Result<String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(&trimmed);
    let domain = without_scheme.trim_end_matches('/');
    if domain.len() > 253 || !domain_re().is_match(domain) {
        return Err(FleetError::InvalidDomain(raw.to_string()));
    }
    Ok(domain.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_slugs() {
        for slug in ["nginx-helper", "redis-cache", "a", "wp_super_cache", "plugin.v2"] {
            validate_slug(slug).unwrap_or_else(|_| panic!("expected valid: {slug}"));
        }
    }

    #[test]
    fn invalid_slugs() {
        for slug in ["", "-dash", "has spaces", "UPPER", "../etc", "a/b"] {
            assert!(validate_slug(slug).is_err(), "expected invalid: {slug}");
        }
    }

    #[test]
    fn domains_are_normalized() {
        assert_eq!(normalize_domain("Example.COM").unwrap(), "example.com");
        assert_eq!(
            normalize_domain("https://shop.example.com/").unwrap(),
            "shop.example.com"
        );
        assert!(normalize_domain("localhost").is_err());
        assert!(normalize_domain("bad domain.com").is_err());
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/var/www/shared");
        assert_eq!(
            baseline_path(root),
            PathBuf::from("/var/www/shared/config/baseline.json")
        );
        assert_eq!(
            release_dir(root, "wp-20240101-000000"),
            PathBuf::from("/var/www/shared/releases/wp-20240101-000000")
        );
        assert_eq!(
            plugins_dir(root),
            PathBuf::from("/var/www/shared/wp-content/plugins")
        );
    }
}
