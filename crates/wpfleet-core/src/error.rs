use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("not initialized: run 'wpfleet init'")]
    NotInitialized,

    #[error("already initialized: pass --force to reinitialize")]
    AlreadyInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("baseline document is corrupt: {0}")]
    CorruptBaseline(String),

    #[error("invalid slug '{0}': must be lowercase alphanumeric with hyphens, dots or underscores")]
    InvalidSlug(String),

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("plugin already in baseline: {0}")]
    PluginExists(String),

    #[error("plugin not in baseline: {0}")]
    PluginNotInBaseline(String),

    #[error("plugin {0} not found on disk")]
    PluginNotFound(String),

    #[error("{kind} '{slug}' is not present in the shared content directory")]
    ArtifactMissing { kind: String, slug: String },

    #[error("fetch failed for {source_desc}: {reason}")]
    FetchFailed { source_desc: String, reason: String },

    #[error("baseline version not found: {0}")]
    VersionNotFound(String),

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("no previous release available for rollback")]
    NoPreviousRelease,

    #[error("site not found: {0}")]
    SiteNotFound(String),

    #[error("site already registered: {0}")]
    SiteExists(String),

    #[error("runtime: {0}")]
    Runtime(String),

    #[error("wp-cli binary not found: {0}")]
    WpCliMissing(String),

    #[error("staging test failed on {domain}: {reason}")]
    StagingFailed { domain: String, reason: String },

    #[error("canary check failed on {domain}: {reason}")]
    CanaryFailed { domain: String, reason: String },

    #[error("aborted by operator")]
    Aborted,

    #[error("baseline lock: {0}")]
    Lock(String),

    #[error("git: {0}")]
    Git(String),

    #[error("registry: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Prefix a runtime failure with what was being attempted.
    pub fn while_doing(self, what: &str) -> Self {
        match self {
            FleetError::Runtime(msg) => FleetError::Runtime(format!("{what}: {msg}")),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
