//! Driving a site's live WordPress state through wp-cli.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::exec::run_with_timeout;

/// One row of `wp plugin list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub version: String,
}

impl PluginStatus {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "active-network")
    }
}

/// Operations the rollout needs against one site. Every call is bounded by
/// the implementation's timeout; a timeout is an `Err`, never a hang.
pub trait SiteRuntimeDriver {
    /// `Ok(None)` when the site does not define the option.
    fn get_option(&self, site_path: &Path, name: &str) -> Result<Option<Value>>;

    fn set_option(&self, site_path: &Path, name: &str, value: &Value) -> Result<()>;

    /// `entry_file` is relative to the plugins directory, e.g. `akismet/akismet.php`.
    fn activate_plugin(&self, site_path: &Path, entry_file: &str) -> Result<()>;

    fn activate_theme(&self, site_path: &Path, theme: &str) -> Result<()>;

    /// Installed plugins as the site itself sees them.
    fn list_plugins(&self, site_path: &Path) -> Result<Vec<PluginStatus>>;
}

// ---------------------------------------------------------------------------
// WpCli
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WpCli {
    bin: String,
    timeout: Duration,
}

impl WpCli {
    pub fn new(bin: &str, timeout: Duration) -> Self {
        Self {
            bin: bin.to_string(),
            timeout,
        }
    }

    /// Fails with `WpCliMissing` when the binary is not on PATH.
    pub fn ensure_installed(&self) -> Result<()> {
        which::which(&self.bin)
            .map(|_| ())
            .map_err(|_| FleetError::WpCliMissing(self.bin.clone()))
    }

    fn command(&self, site_path: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .arg(format!("--path={}", site_path.display()))
            .arg("--allow-root")
            .env("WP_CLI_DISABLE_AUTO_CHECK_UPDATE", "1");
        cmd
    }

    /// Run and require a zero exit, returning stdout.
    fn run_ok(&self, site_path: &Path, args: &[&str], what: &str) -> Result<String> {
        debug!(site = %site_path.display(), ?args, "wp-cli");
        let out = run_with_timeout(&mut self.command(site_path, args), self.timeout)
            .map_err(|e| e.while_doing(what))?;
        if !out.success {
            return Err(FleetError::Runtime(format!("{what}: {}", out.diagnostic())));
        }
        Ok(out.stdout)
    }
}

impl SiteRuntimeDriver for WpCli {
    fn get_option(&self, site_path: &Path, name: &str) -> Result<Option<Value>> {
        let out = run_with_timeout(
            &mut self.command(site_path, &["option", "get", name, "--format=json"]),
            self.timeout,
        )
        .map_err(|e| e.while_doing(&format!("get option {name}")))?;
        if !out.success {
            debug!(option = name, error = %out.diagnostic(), "option not readable");
            return Ok(None);
        }
        Ok(Some(parse_option(&out.stdout)))
    }

    fn set_option(&self, site_path: &Path, name: &str, value: &Value) -> Result<()> {
        let what = format!("set option {name}");
        match value {
            Value::String(s) => self.run_ok(site_path, &["option", "update", name, s], &what)?,
            other => {
                let json = serde_json::to_string(other)?;
                self.run_ok(
                    site_path,
                    &["option", "update", name, &json, "--format=json"],
                    &what,
                )?
            }
        };
        Ok(())
    }

    fn activate_plugin(&self, site_path: &Path, entry_file: &str) -> Result<()> {
        self.run_ok(
            site_path,
            &["plugin", "activate", entry_file],
            &format!("activate {entry_file}"),
        )?;
        Ok(())
    }

    fn activate_theme(&self, site_path: &Path, theme: &str) -> Result<()> {
        self.run_ok(
            site_path,
            &["theme", "activate", theme],
            &format!("activate theme {theme}"),
        )?;
        Ok(())
    }

    fn list_plugins(&self, site_path: &Path) -> Result<Vec<PluginStatus>> {
        let out = self.run_ok(
            site_path,
            &["plugin", "list", "--format=json", "--fields=name,status,version"],
            "list plugins",
        )?;
        Ok(serde_json::from_str(out.trim())?)
    }
}

/// wp-cli prints JSON for structured options and sometimes bare text for
/// scalars; keep whichever it gave us.
fn parse_option(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A stand-in `wp` that answers from a shell script.
    fn fake_wp(dir: &Path, script: &str) -> WpCli {
        let bin = dir.join("wp");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        WpCli::new(bin.to_str().unwrap(), Duration::from_secs(5))
    }

    #[test]
    fn parse_option_handles_json_and_text() {
        assert_eq!(parse_option("[\"a/a.php\"]\n"), serde_json::json!(["a/a.php"]));
        assert_eq!(parse_option("\"UTC\""), Value::String("UTC".into()));
        assert_eq!(parse_option("plain text"), Value::String("plain text".into()));
    }

    #[test]
    fn get_option_absent_is_none() {
        let dir = TempDir::new().unwrap();
        let wp = fake_wp(dir.path(), "echo \"Error: Could not get option\" >&2; exit 1");
        assert_eq!(wp.get_option(dir.path(), "blogdescription").unwrap(), None);
    }

    #[test]
    fn get_option_returns_json() {
        let dir = TempDir::new().unwrap();
        let wp = fake_wp(dir.path(), "echo '[\"hello.php\"]'");
        assert_eq!(
            wp.get_option(dir.path(), "active_plugins").unwrap(),
            Some(serde_json::json!(["hello.php"]))
        );
    }

    #[test]
    fn activation_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let wp = fake_wp(dir.path(), "echo 'Error: Plugin file does not exist.' >&2; exit 1");
        let err = wp.activate_plugin(dir.path(), "x/x.php").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("activate x/x.php"), "{msg}");
        assert!(msg.contains("does not exist"), "{msg}");
    }

    #[test]
    fn passes_path_and_allow_root() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("args.log");
        let wp = fake_wp(dir.path(), &format!("echo \"$@\" > {}", log.display()));
        wp.activate_theme(Path::new("/var/www/a.test"), "astra").unwrap();
        let args = std::fs::read_to_string(log).unwrap();
        assert!(args.contains("theme activate astra"), "{args}");
        assert!(args.contains("--path=/var/www/a.test"), "{args}");
        assert!(args.contains("--allow-root"), "{args}");
    }

    #[test]
    fn list_plugins_parses_json() {
        let dir = TempDir::new().unwrap();
        let wp = fake_wp(
            dir.path(),
            r#"echo '[{"name":"akismet","status":"active","version":"5.3"},{"name":"hello","status":"inactive","version":"1.7.2"}]'"#,
        );
        let plugins = wp.list_plugins(dir.path()).unwrap();
        assert_eq!(plugins.len(), 2);
        assert!(plugins[0].is_active());
        assert_eq!((plugins[1].name.as_str(), plugins[1].is_active()), ("hello", false));
    }

    #[test]
    fn slow_call_times_out() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("wp");
        std::fs::write(&bin, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let wp = WpCli::new(bin.to_str().unwrap(), Duration::from_secs(1));
        let err = wp.activate_theme(dir.path(), "astra").unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
