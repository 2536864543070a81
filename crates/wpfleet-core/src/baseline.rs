//! The baseline: the versioned desired state every tenant site converges to.
//!
//! The document lives at `config/baseline.json` under the shared root. Each
//! mutation goes through [`BaselineStore::mutate`], which holds an exclusive
//! lock on `config/baseline.lock`, bumps the version by exactly one, writes the
//! document atomically and appends a full snapshot to
//! `config/baseline.history.jsonl`. History is never rewritten: reverting to an
//! old version produces a new version with the old contents.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::git::GitMirror;
use crate::paths;

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub version: u64,
    pub generated: DateTime<Utc>,
    /// Activation order is list order.
    pub plugins: Vec<String>,
    #[serde(default)]
    pub theme: Option<String>,
    /// Option defaults applied only where the site has no value yet.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Baseline {
    /// A version-1 document. Duplicate plugin slugs are dropped, first one wins.
    pub fn initial(
        plugins: Vec<String>,
        theme: Option<String>,
        options: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut deduped: Vec<String> = Vec::with_capacity(plugins.len());
        for p in plugins {
            if !deduped.contains(&p) {
                deduped.push(p);
            }
        }
        Self {
            version: 1,
            generated: Utc::now(),
            plugins: deduped,
            theme,
            options,
        }
    }

    pub fn has_plugin(&self, slug: &str) -> bool {
        self.plugins.iter().any(|p| p == slug)
    }

    pub fn add_plugin(&mut self, slug: &str) -> Result<()> {
        paths::validate_slug(slug)?;
        if self.has_plugin(slug) {
            return Err(FleetError::PluginExists(slug.to_string()));
        }
        self.plugins.push(slug.to_string());
        Ok(())
    }

    pub fn remove_plugin(&mut self, slug: &str) -> Result<()> {
        let before = self.plugins.len();
        self.plugins.retain(|p| p != slug);
        if self.plugins.len() == before {
            return Err(FleetError::PluginNotInBaseline(slug.to_string()));
        }
        Ok(())
    }

    pub fn set_theme(&mut self, theme: Option<&str>) -> Result<()> {
        if let Some(t) = theme {
            paths::validate_slug(t)?;
        }
        self.theme = theme.map(str::to_string);
        Ok(())
    }

    /// True when the plugin list, theme and options match, ignoring version and timestamp.
    pub fn same_content(&self, other: &Baseline) -> bool {
        self.plugins == other.plugins && self.theme == other.theme && self.options == other.options
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One line of `baseline.history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub baseline: Baseline,
}

/// Target of a baseline revert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryRef {
    Version(u64),
    /// Commit sha or tag in the git mirror.
    Commit(String),
}

impl std::fmt::Display for HistoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryRef::Version(v) => write!(f, "v{v}"),
            HistoryRef::Commit(c) => write!(f, "commit {c}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock guard
// ---------------------------------------------------------------------------

struct LockGuard {
    file: File,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()
            .map_err(|e| FleetError::Lock(e.to_string()))?;
        Ok(Self { file })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// BaselineStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BaselineStore {
    root: PathBuf,
    git: Option<GitMirror>,
}

impl BaselineStore {
    /// A store rooted at the shared root, without the git mirror.
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            git: None,
        }
    }

    /// Mirror every mutation into git when a git binary is available.
    pub fn with_git_mirror(mut self) -> Self {
        self.git = GitMirror::detect(&self.root);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Option<&GitMirror> {
        self.git.as_ref()
    }

    pub fn exists(&self) -> bool {
        paths::baseline_path(&self.root).exists()
    }

    pub fn read(&self) -> Result<Baseline> {
        let path = paths::baseline_path(&self.root);
        if !path.exists() {
            return Err(FleetError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| FleetError::CorruptBaseline(e.to_string()))
    }

    /// Write baseline v1. With `force` on an existing store the initial
    /// content is recorded as the next version instead, so history stays intact.
    pub fn create(&self, initial: Baseline, force: bool) -> Result<Baseline> {
        let _lock = LockGuard::acquire(&paths::lock_path(&self.root))?;
        if self.exists() {
            if !force {
                return Err(FleetError::AlreadyInitialized);
            }
            warn!("baseline exists, recording reinitialization as a new version");
            return self.mutate_locked("reinitialize from config", move |mut b| {
                b.plugins = initial.plugins;
                b.theme = initial.theme;
                b.options = initial.options;
                Ok(b)
            });
        }

        let mut doc = initial;
        doc.version = self.history_head()?.unwrap_or(0) + 1;
        doc.generated = Utc::now();
        self.persist(&doc, "initial baseline")?;
        info!(version = doc.version, plugins = doc.plugins.len(), "created baseline");
        Ok(doc)
    }

    /// Apply `transform` to the current document and persist the result as
    /// the next version. The store owns the version counter: whatever version
    /// the transform returns is overwritten with `old + 1`.
    pub fn mutate<F>(&self, summary: &str, transform: F) -> Result<Baseline>
    where
        F: FnOnce(Baseline) -> Result<Baseline>,
    {
        let _lock = LockGuard::acquire(&paths::lock_path(&self.root))?;
        self.mutate_locked(summary, transform)
    }

    /// Caller must hold the lock.
    fn mutate_locked<F>(&self, summary: &str, transform: F) -> Result<Baseline>
    where
        F: FnOnce(Baseline) -> Result<Baseline>,
    {
        let current = self.read()?;
        // History may already hold a version whose document write never landed.
        let last = current.version.max(self.history_head()?.unwrap_or(0));
        let mut next = transform(current)?;
        next.version = last + 1;
        next.generated = Utc::now();
        self.persist(&next, summary)?;
        info!(version = next.version, summary, "baseline updated");
        Ok(next)
    }

    /// Up to `limit` history entries, newest first. Each call re-reads the
    /// history file; entries are parsed as the iterator is consumed.
    pub fn history(&self, limit: usize) -> Result<impl Iterator<Item = Result<HistoryEntry>>> {
        let lines = self.history_lines()?;
        Ok(lines
            .into_iter()
            .rev()
            .take(limit)
            .map(|line| serde_json::from_str::<HistoryEntry>(&line).map_err(FleetError::from)))
    }

    /// Highest version recorded in history, if any.
    pub fn history_head(&self) -> Result<Option<u64>> {
        match self.history(1)?.next() {
            Some(entry) => Ok(Some(entry?.version)),
            None => Ok(None),
        }
    }

    /// Snapshot stored for `version`.
    pub fn snapshot(&self, version: u64) -> Result<Baseline> {
        for line in self.history_lines()? {
            let entry: HistoryEntry = serde_json::from_str(&line)?;
            if entry.version == version {
                return Ok(entry.baseline);
            }
        }
        Err(FleetError::VersionNotFound(format!("v{version}")))
    }

    /// Write the contents found at `target` back as a new version.
    pub fn revert_to(&self, target: &HistoryRef) -> Result<Baseline> {
        let snapshot = match target {
            HistoryRef::Version(v) => self.snapshot(*v)?,
            HistoryRef::Commit(reference) => {
                let git = self
                    .git
                    .as_ref()
                    .ok_or_else(|| FleetError::Git("git mirror is not available".to_string()))?;
                let text = git.show_baseline(reference)?;
                serde_json::from_str::<Baseline>(&text)
                    .map_err(|e| FleetError::CorruptBaseline(format!("{reference}: {e}")))?
            }
        };
        let summary = format!("revert to {target}");
        self.mutate(&summary, move |mut b| {
            b.plugins = snapshot.plugins;
            b.theme = snapshot.theme;
            b.options = snapshot.options;
            Ok(b)
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn history_lines(&self) -> Result<Vec<String>> {
        let path = paths::history_path(&self.root);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// History first, then the document: every version the document can
    /// show has a snapshot to revert to. Caller must hold the lock.
    fn persist(&self, doc: &Baseline, summary: &str) -> Result<()> {
        let entry = HistoryEntry {
            version: doc.version,
            summary: summary.to_string(),
            timestamp: doc.generated,
            baseline: doc.clone(),
        };
        crate::io::append_line(
            &paths::history_path(&self.root),
            &serde_json::to_string(&entry)?,
        )?;

        let data = serde_json::to_string_pretty(doc)?;
        crate::io::atomic_write(&paths::baseline_path(&self.root), data.as_bytes())?;

        if let Some(git) = &self.git {
            let message = format!("baseline v{}: {summary}", doc.version);
            if let Err(e) = git.commit(&message) {
                warn!(error = %e, "baseline git mirror commit failed");
            } else {
                debug!(message, "mirrored baseline to git");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
