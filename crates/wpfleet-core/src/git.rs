//! Git mirror of the baseline document.
//!
//! The shared root doubles as a git repository whose `.gitignore` admits only
//! `config/baseline.json`. Every baseline mutation becomes one commit, which
//! gives operators `git log` / `git show` over the desired fleet state and lets
//! `baseline rollback --to-commit` resolve a document by commit or tag.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::paths;

const GITIGNORE: &str = "# Track only the baseline document\n*\n!.gitignore\n!config/\n!config/baseline.json\n";

#[derive(Debug, Clone)]
pub struct GitMirror {
    root: PathBuf,
}

/// One commit touching the baseline document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitCommit {
    pub sha: String,
    pub subject: String,
}

impl GitMirror {
    /// Returns a mirror for `root` if a `git` binary is on PATH.
    pub fn detect(root: &Path) -> Option<Self> {
        match which::which("git") {
            Ok(_) => Some(Self {
                root: root.to_path_buf(),
            }),
            Err(_) => {
                tracing::debug!("git not installed, baseline mirror disabled");
                None
            }
        }
    }

    /// Initialize the repository if needed. Idempotent.
    pub fn ensure_repo(&self) -> Result<()> {
        if self.root.join(".git").exists() {
            return Ok(());
        }
        self.run_checked(&["init", "--quiet"])?;
        self.run_checked(&["config", "user.name", "wpfleet"])?;
        self.run_checked(&["config", "user.email", "wpfleet@localhost"])?;
        crate::io::write_if_missing(&self.root.join(".gitignore"), GITIGNORE.as_bytes())?;
        tracing::debug!(root = %self.root.display(), "initialized baseline git mirror");
        Ok(())
    }

    /// Stage and commit the baseline document. A clean tree is not an error.
    pub fn commit(&self, message: &str) -> Result<()> {
        self.ensure_repo()?;
        self.run_checked(&["add", ".gitignore", paths::BASELINE_FILE])?;
        let out = self.run(&["commit", "--quiet", "-m", message])?;
        if out.status.success() {
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        if stdout.contains("nothing to commit") || stdout.contains("nothing added to commit") {
            return Ok(());
        }
        Err(FleetError::Git(stderr_or_stdout(&out)))
    }

    /// Contents of the baseline document as of `reference` (commit sha or tag).
    pub fn show_baseline(&self, reference: &str) -> Result<String> {
        validate_ref(reference)?;
        let spec = format!("{reference}:{}", paths::BASELINE_FILE);
        let out = self.run(&["show", &spec])?;
        if !out.status.success() {
            return Err(FleetError::VersionNotFound(reference.to_string()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Most recent commits, newest first.
    pub fn log(&self, limit: usize) -> Result<Vec<GitCommit>> {
        if !self.root.join(".git").exists() {
            return Ok(Vec::new());
        }
        let n = format!("-n{limit}");
        let out = self.run_checked(&["log", &n, "--format=%h%x09%s", "--", paths::BASELINE_FILE])?;
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text
            .lines()
            .filter_map(|line| {
                let (sha, subject) = line.split_once('\t')?;
                Some(GitCommit {
                    sha: sha.to_string(),
                    subject: subject.to_string(),
                })
            })
            .collect())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FleetError::Git(e.to_string()))
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let out = self.run(args)?;
        if !out.status.success() {
            return Err(FleetError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr_or_stdout(&out)
            )));
        }
        Ok(out)
    }
}

fn stderr_or_stdout(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}

/// Reject references that git would parse as options.
fn validate_ref(reference: &str) -> Result<()> {
    if reference.is_empty()
        || reference.starts_with('-')
        || reference.chars().any(|c| c.is_whitespace() || c == ':')
    {
        return Err(FleetError::VersionNotFound(reference.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn refs_that_look_like_options_are_rejected() {
        assert!(validate_ref("--upload-pack=x").is_err());
        assert!(validate_ref("abc def").is_err());
        assert!(validate_ref("HEAD:secret").is_err());
        assert!(validate_ref("a1b2c3d").is_ok());
        assert!(validate_ref("v1.2.0").is_ok());
    }

    #[test]
    fn commit_and_show_roundtrip() {
        let dir = TempDir::new().unwrap();
        let Some(git) = GitMirror::detect(dir.path()) else {
            return;
        };
        let doc = paths::baseline_path(dir.path());
        crate::io::atomic_write(&doc, b"{\"version\":1}").unwrap();
        git.commit("baseline v1: init").unwrap();
        crate::io::atomic_write(&doc, b"{\"version\":2}").unwrap();
        git.commit("baseline v2: add plugin").unwrap();

        let log = git.log(10).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].subject, "baseline v2: add plugin");

        let old = git.show_baseline(&log[1].sha).unwrap();
        assert_eq!(old, "{\"version\":1}");
    }

    #[test]
    fn committing_unchanged_document_is_ok() {
        let dir = TempDir::new().unwrap();
        let Some(git) = GitMirror::detect(dir.path()) else {
            return;
        };
        crate::io::atomic_write(&paths::baseline_path(dir.path()), b"{}").unwrap();
        git.commit("first").unwrap();
        git.commit("again").unwrap();
        assert_eq!(git.log(10).unwrap().len(), 1);
    }
}
