//! WordPress core releases under `<shared_root>/releases`.
//!
//! Release ids embed their creation time (`wp-YYYYmmdd-HHMMSS`), so a
//! lexicographic sort is a chronological sort. `<shared_root>/current` is a
//! symlink to exactly one release and is only ever replaced by rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::paths;

#[derive(Debug, Clone)]
pub struct ReleaseManager {
    root: PathBuf,
}

impl ReleaseManager {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn release_path(&self, id: &str) -> PathBuf {
        paths::release_dir(&self.root, id)
    }

    /// Release ids, newest first.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = paths::releases_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut releases = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(paths::RELEASE_PREFIX) && entry.file_type()?.is_dir() {
                releases.push(name);
            }
        }
        releases.sort_unstable_by(|a, b| b.cmp(a));
        Ok(releases)
    }

    /// The release `current` points at, if the link exists.
    pub fn current(&self) -> Result<Option<String>> {
        let link = paths::current_link(&self.root);
        if link.symlink_metadata().is_err() {
            return Ok(None);
        }
        let target = std::fs::read_link(&link)?;
        Ok(target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()))
    }

    /// True when `current` exists and resolves to a directory.
    pub fn current_is_valid(&self) -> bool {
        paths::current_link(&self.root).is_dir()
    }

    /// Repoint `current` at `id`. The target is checked first and the link is
    /// swapped by renaming a fresh symlink over the old one, so `current` is
    /// never missing or dangling.
    pub fn activate(&self, id: &str) -> Result<()> {
        let target = self.release_path(id);
        if !id.starts_with(paths::RELEASE_PREFIX) || !target.is_dir() {
            return Err(FleetError::ReleaseNotFound(id.to_string()));
        }
        let link = paths::current_link(&self.root);
        let staged = self
            .root
            .join(format!(".{}.{}", paths::CURRENT_LINK, std::process::id()));
        if staged.symlink_metadata().is_ok() {
            std::fs::remove_file(&staged)?;
        }
        std::os::unix::fs::symlink(&target, &staged)?;
        if let Err(e) = std::fs::rename(&staged, &link) {
            let _ = std::fs::remove_file(&staged);
            return Err(e.into());
        }
        info!(release = id, "activated release");
        Ok(())
    }

    /// The release immediately older than `current_id`.
    pub fn previous(&self, current_id: &str) -> Result<Option<String>> {
        let releases = self.list()?;
        Ok(releases
            .iter()
            .position(|r| r == current_id)
            .and_then(|i| releases.get(i + 1).cloned()))
    }

    /// Delete every release beyond the newest `keep`, never the current one.
    /// Deletion is best-effort: failures are logged and skipped. Returns the
    /// ids actually removed.
    pub fn retain(&self, keep: usize) -> Result<Vec<String>> {
        let releases = self.list()?;
        let current = self.current()?;
        let mut removed = Vec::new();
        for id in releases.iter().skip(keep) {
            if current.as_deref() == Some(id.as_str()) {
                debug!(release = %id, "keeping current release outside retention window");
                continue;
            }
            match std::fs::remove_dir_all(self.release_path(id)) {
                Ok(()) => {
                    debug!(release = %id, "removed old release");
                    removed.push(id.clone());
                }
                Err(e) => warn!(release = %id, error = %e, "could not remove old release"),
            }
        }
        Ok(removed)
    }

    /// Delete one release. The current release is never removed; returns
    /// whether a directory was deleted.
    pub fn remove(&self, id: &str) -> Result<bool> {
        if self.current()?.as_deref() == Some(id) {
            warn!(release = %id, "refusing to remove the current release");
            return Ok(false);
        }
        let dir = self.release_path(id);
        if !dir.is_dir() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        info!(release = %id, "removed release");
        Ok(true)
    }

    /// A fresh release id for `now` that does not collide with an existing directory.
    pub fn allocate_id(&self, now: DateTime<Utc>) -> String {
        let base = release_id(now);
        if !self.release_path(&base).exists() {
            return base;
        }
        (1..)
            .map(|n| format!("{base}-{n}"))
            .find(|id| !self.release_path(id).exists())
            .unwrap_or(base)
    }

    /// Record the current release name under `backups/` before a switch.
    pub fn record_backup(&self) -> Result<Option<PathBuf>> {
        let Some(current) = self.current()? else {
            return Ok(None);
        };
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let path = paths::backups_dir(&self.root).join(format!("release-{stamp}.txt"));
        crate::io::atomic_write(&path, current.as_bytes())?;
        debug!(path = %path.display(), "recorded release backup");
        Ok(Some(path))
    }
}

/// `wp-YYYYmmdd-HHMMSS`
pub fn release_id(now: DateTime<Utc>) -> String {
    format!("{}{}", paths::RELEASE_PREFIX, now.format("%Y%m%d-%H%M%S"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
