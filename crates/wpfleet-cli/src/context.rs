use anyhow::Context;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use wpfleet_core::config::{Config, DEFAULT_CONFIG_PATH};
use wpfleet_core::fleet::{Fleet, Services};

/// `--config` / `WPFLEET_CONFIG`, else the system-wide default.
pub fn resolve_config(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config =
        Config::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    for warning in config.validate() {
        tracing::warn!(level = ?warning.level, "{}", warning.message);
    }
    Ok(config)
}

/// Build the production collaborators and run `f` against the fleet.
pub fn with_fleet<T>(
    config_path: &Path,
    f: impl FnOnce(&Fleet<'_>) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let config = load_config(config_path)?;
    let services = Services::from_config(&config)?;
    let fleet = Fleet::open(config, services.collaborators()).context("failed to open fleet")?;
    f(&fleet)
}

/// Ask on stderr, read y/N from stdin. EOF or anything but `y` declines.
pub fn confirm(prompt: &str) -> bool {
    eprint!("{prompt} [y/N]: ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
    }
}

/// Confirm for a rollout with no staging site. Without a terminal on stdin
/// (cron, pipelines, `--apply` in scripts) nobody can answer, so the warning
/// is logged and the rollout goes ahead.
pub fn confirm_rollout(prompt: &str) -> bool {
    if !std::io::stdin().is_terminal() {
        tracing::warn!("{prompt} (no terminal, continuing)");
        return true;
    }
    confirm(prompt)
}
