//! The must-use plugin every tenant loads from the shared tree. It brings a
//! site up to the baseline on its next admin or wp-cli request, so sites
//! that missed a rollout (disabled, offline, added later) still converge.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::applicator::BASELINE_VERSION_OPTION;
use crate::catalog::PLUGIN_ENTRY_PATTERNS;
use crate::error::Result;
use crate::paths;

pub const ENFORCER_FILE: &str = "wpfleet-baseline-enforcer.php";

const TEMPLATE: &str = r#"<?php
/**
 * Plugin Name: wpfleet baseline enforcer
 * Description: Activates the shared baseline plugins, theme and option defaults.
 * Version: __WPFLEET_VERSION__
 *
 * Generated by wpfleet. Edits are overwritten on the next init.
 */

if (!defined('ABSPATH')) {
    exit;
}

add_action('init', function () {
    if (defined('WP_INSTALLING') && WP_INSTALLING) {
        return;
    }
    if (!is_blog_installed() || wp_doing_ajax()) {
        return;
    }
    if (!is_admin() && !(defined('WP_CLI') && WP_CLI)) {
        return;
    }

    $file = '__BASELINE_FILE__';
    if (!is_readable($file)) {
        return;
    }
    $baseline = json_decode((string) file_get_contents($file), true);
    if (!is_array($baseline) || !isset($baseline['version'])) {
        return;
    }
    $version = (int) $baseline['version'];
    if ((int) get_option('__VERSION_OPTION__', 0) === $version) {
        return;
    }

    if (!function_exists('activate_plugin')) {
        require_once ABSPATH . 'wp-admin/includes/plugin.php';
    }
    $patterns = array(__ENTRY_PATTERNS__);
    $plugins = isset($baseline['plugins']) ? (array) $baseline['plugins'] : array();
    foreach ($plugins as $slug) {
        foreach ($patterns as $pattern) {
            $entry = str_replace('{slug}', $slug, $pattern);
            if (!file_exists(WP_PLUGIN_DIR . '/' . $entry)) {
                continue;
            }
            if (!is_plugin_active($entry)) {
                activate_plugin($entry, '', false, true);
            }
            break;
        }
    }

    $theme = isset($baseline['theme']) ? $baseline['theme'] : null;
    if (is_string($theme) && $theme !== '' && get_stylesheet() !== $theme) {
        if (wp_get_theme($theme)->exists()) {
            switch_theme($theme);
        }
    }

    $options = isset($baseline['options']) ? (array) $baseline['options'] : array();
    foreach ($options as $name => $value) {
        if (get_option($name) === false) {
            update_option($name, $value);
        }
    }

    update_option('__VERSION_OPTION__', $version);
    wp_cache_flush();
}, 5);
"#;

pub fn enforcer_path(root: &Path) -> PathBuf {
    paths::mu_plugins_dir(root).join(ENFORCER_FILE)
}

/// PHP source of the enforcer, reading the baseline document at `baseline_file`.
pub fn render(baseline_file: &Path) -> String {
    let patterns = PLUGIN_ENTRY_PATTERNS
        .iter()
        .map(|p| format!("'{}'", php_quote(p)))
        .collect::<Vec<_>>()
        .join(", ");
    TEMPLATE
        .replace("__WPFLEET_VERSION__", env!("CARGO_PKG_VERSION"))
        .replace("__BASELINE_FILE__", &php_quote(&baseline_file.display().to_string()))
        .replace("__VERSION_OPTION__", BASELINE_VERSION_OPTION)
        .replace("__ENTRY_PATTERNS__", &patterns)
}

/// Write the enforcer into the shared `mu-plugins` directory.
pub fn install(root: &Path) -> Result<PathBuf> {
    let path = enforcer_path(root);
    crate::io::ensure_dir(&paths::mu_plugins_dir(root))?;
    crate::io::atomic_write(&path, render(&paths::baseline_path(root)).as_bytes())?;
    info!(path = %path.display(), "installed baseline enforcer");
    Ok(path)
}

/// The installed enforcer matches what this build would write.
pub fn is_current(root: &Path) -> bool {
    std::fs::read_to_string(enforcer_path(root))
        .map(|text| text == render(&paths::baseline_path(root)))
        .unwrap_or(false)
}

/// Escape for a single-quoted PHP string literal.
fn php_quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn render_embeds_document_option_and_entry_patterns() {
        let php = render(Path::new("/srv/shared/config/baseline.json"));
        assert!(php.starts_with("<?php"));
        assert!(php.contains("$file = '/srv/shared/config/baseline.json';"));
        assert!(php.contains(&format!("get_option('{BASELINE_VERSION_OPTION}', 0)")));
        assert!(php.contains(&format!("update_option('{BASELINE_VERSION_OPTION}', $version)")));
        for pattern in PLUGIN_ENTRY_PATTERNS {
            assert!(php.contains(&format!("'{pattern}'")), "{pattern}");
        }
        assert!(!php.contains("__"), "unreplaced placeholder");
    }

    #[test]
    fn render_skips_installs_ajax_and_front_end() {
        let php = render(Path::new("/x/baseline.json"));
        assert!(php.contains("WP_INSTALLING"));
        assert!(php.contains("is_blog_installed()"));
        assert!(php.contains("wp_doing_ajax()"));
        assert!(php.contains("!is_admin() && !(defined('WP_CLI') && WP_CLI)"));
        assert!(php.contains("get_option($name) === false"));
    }

    #[test]
    fn quotes_in_path_are_escaped() {
        let php = render(Path::new("/srv/o'brien/baseline.json"));
        assert!(php.contains(r"$file = '/srv/o\'brien/baseline.json';"));
    }

    #[test]
    fn install_writes_into_mu_plugins() {
        let dir = TempDir::new().unwrap();
        assert!(!is_current(dir.path()));
        let path = install(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("wp-content/mu-plugins").join(ENFORCER_FILE));
        assert!(is_current(dir.path()));

        std::fs::write(&path, "<?php // edited").unwrap();
        assert!(!is_current(dir.path()));
        install(dir.path()).unwrap();
        assert!(is_current(dir.path()));
    }
}
