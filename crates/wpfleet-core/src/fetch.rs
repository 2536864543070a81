//! Downloading plugin/theme bundles and WordPress core releases.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{FleetError, Result};
use crate::exec::run_with_timeout;
use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Plugin,
    Theme,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Plugin => "plugin",
            ArtifactKind::Theme => "theme",
        }
    }

    /// Directory under the shared root holding artifacts of this kind.
    pub fn dir(self, root: &Path) -> PathBuf {
        match self {
            ArtifactKind::Plugin => paths::plugins_dir(root),
            ArtifactKind::Theme => paths::themes_dir(root),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    Branch(String),
    Tag(String),
    /// Try `main`, then `master`.
    DefaultBranch,
}

/// Where a plugin or theme bundle is downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// The WordPress.org directory, by slug.
    Registry,
    GitHub { repo: String, git_ref: GitRef },
    Url(String),
}

impl ArtifactSource {
    /// Candidate archive URLs, tried in order until one exists.
    pub fn archive_urls(&self, kind: ArtifactKind, slug: &str) -> Vec<String> {
        match self {
            ArtifactSource::Registry => vec![format!(
                "https://downloads.wordpress.org/{}/{slug}.latest-stable.zip",
                kind.as_str()
            )],
            ArtifactSource::GitHub { repo, git_ref } => {
                let base = format!("https://github.com/{repo}/archive/refs");
                match git_ref {
                    GitRef::Tag(tag) => vec![format!("{base}/tags/{tag}.zip")],
                    GitRef::Branch(branch) => vec![format!("{base}/heads/{branch}.zip")],
                    GitRef::DefaultBranch => vec![
                        format!("{base}/heads/main.zip"),
                        format!("{base}/heads/master.zip"),
                    ],
                }
            }
            ArtifactSource::Url(url) => vec![url.clone()],
        }
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::Registry => f.write_str("wordpress.org"),
            ArtifactSource::GitHub { repo, git_ref } => match git_ref {
                GitRef::Tag(t) => write!(f, "github:{repo}@{t}"),
                GitRef::Branch(b) => write!(f, "github:{repo}#{b}"),
                GitRef::DefaultBranch => write!(f, "github:{repo}"),
            },
            ArtifactSource::Url(url) => f.write_str(url),
        }
    }
}

pub trait ArtifactFetcher {
    /// Ensure `<target_dir>/<slug>` holds the unpacked bundle and return that
    /// path. A directory that already exists is left untouched.
    fn fetch(
        &self,
        kind: ArtifactKind,
        slug: &str,
        source: &ArtifactSource,
        target_dir: &Path,
    ) -> Result<PathBuf>;

    /// Download WordPress core (without `wp-content`) into `release_dir`.
    fn fetch_core(&self, release_dir: &Path) -> Result<()>;

    /// Check a downloaded release is a complete, unmodified core.
    fn verify_core(&self, release_dir: &Path) -> Result<()>;
}

/// Files whose absence means a core download is unusable.
pub const CORE_MARKERS: &[&str] = &["wp-load.php", "wp-settings.php", "wp-includes/version.php"];

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Bundles over HTTPS (unpacked with `unzip`), core through `wp core download`.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    wp_bin: String,
    locale: String,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(wp_bin: &str, locale: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("wpfleet/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| FleetError::FetchFailed {
                source_desc: "http client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            wp_bin: wp_bin.to_string(),
            locale: locale.to_string(),
            timeout,
        })
    }

    /// Download `url` into `dest`. Ok(false) on 404 so the caller can try
    /// the next candidate.
    fn download(&self, url: &str, dest: &Path) -> Result<bool> {
        let failed = |reason: String| FleetError::FetchFailed {
            source_desc: url.to_string(),
            reason,
        };
        let resp = self.client.get(url).send().map_err(|e| failed(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(url, "archive not found");
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(failed(format!("HTTP {}", resp.status())));
        }
        let bytes = resp.bytes().map_err(|e| failed(e.to_string()))?;
        std::fs::write(dest, &bytes)?;
        debug!(url, bytes = bytes.len(), "downloaded archive");
        Ok(true)
    }

    fn unzip(&self, archive: &Path, dest: &Path) -> Result<()> {
        which::which("unzip").map_err(|_| FleetError::FetchFailed {
            source_desc: archive.display().to_string(),
            reason: "unzip is not installed".to_string(),
        })?;
        let out = run_with_timeout(
            Command::new("unzip").arg("-q").arg("-o").arg(archive).arg("-d").arg(dest),
            Duration::from_secs(300),
        )?;
        if !out.success {
            return Err(FleetError::FetchFailed {
                source_desc: archive.display().to_string(),
                reason: out.diagnostic(),
            });
        }
        Ok(())
    }

    fn wp(&self, args: &[&str], timeout: Duration) -> Result<()> {
        which::which(&self.wp_bin).map_err(|_| FleetError::WpCliMissing(self.wp_bin.clone()))?;
        let mut cmd = Command::new(&self.wp_bin);
        cmd.args(args).arg("--allow-root");
        let out = run_with_timeout(&mut cmd, timeout)?;
        if !out.success {
            return Err(FleetError::Runtime(out.diagnostic()));
        }
        Ok(())
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(
        &self,
        kind: ArtifactKind,
        slug: &str,
        source: &ArtifactSource,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        paths::validate_slug(slug)?;
        let dest = target_dir.join(slug);
        if dest.exists() {
            debug!(kind = %kind, slug, "already present, skipping download");
            return Ok(dest);
        }
        crate::io::ensure_dir(target_dir)?;

        // Unpack next to the destination so the final move is a same-filesystem rename.
        let work = tempfile::Builder::new()
            .prefix(".wpfleet-fetch-")
            .tempdir_in(target_dir)?;
        let archive = work.path().join("bundle.zip");

        let mut found = None;
        for url in source.archive_urls(kind, slug) {
            if self.download(&url, &archive)? {
                found = Some(url);
                break;
            }
        }
        let Some(url) = found else {
            return Err(FleetError::FetchFailed {
                source_desc: source.to_string(),
                reason: format!("{kind} '{slug}' not found"),
            });
        };

        let extract = work.path().join("extract");
        self.unzip(&archive, &extract)?;
        let root = single_top_level_dir(&extract)?.unwrap_or(extract);
        std::fs::rename(&root, &dest)?;
        info!(kind = %kind, slug, url = %url, "installed artifact");
        Ok(dest)
    }

    fn fetch_core(&self, release_dir: &Path) -> Result<()> {
        crate::io::ensure_dir(release_dir)?;
        let path = format!("--path={}", release_dir.display());
        let locale = format!("--locale={}", self.locale);
        // Core downloads are slow; allow well beyond the per-call default.
        self.wp(
            &["core", "download", &path, &locale, "--skip-content", "--force"],
            self.timeout.max(Duration::from_secs(600)),
        )?;
        info!(release = %release_dir.display(), "downloaded WordPress core");
        Ok(())
    }

    fn verify_core(&self, release_dir: &Path) -> Result<()> {
        check_core_markers(release_dir)?;
        let path = format!("--path={}", release_dir.display());
        self.wp(&["core", "verify-checksums", &path], self.timeout)
            .map_err(|e| FleetError::FetchFailed {
                source_desc: release_dir.display().to_string(),
                reason: format!("core checksum verification failed: {e}"),
            })
    }
}

/// The required core files exist in `release_dir`.
pub fn check_core_markers(release_dir: &Path) -> Result<()> {
    let missing: Vec<&str> = CORE_MARKERS
        .iter()
        .copied()
        .filter(|m| !release_dir.join(m).is_file())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(FleetError::FetchFailed {
        source_desc: release_dir.display().to_string(),
        reason: format!("incomplete core, missing {}", missing.join(", ")),
    })
}

/// Archives usually wrap their contents in one directory (`<slug>/` on
/// WordPress.org, `<repo>-<ref>/` on GitHub).
fn single_top_level_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(Some(only.path()));
        }
    }
    Ok(None)
}
