//! Fleet-wide cache invalidation.

use std::process::Command;
use std::time::Duration;

use tracing::{info, warn};

use crate::exec::run_with_timeout;

pub trait CacheController {
    /// Clear every cache layer. Best-effort: returns whether it worked.
    fn clear_all_caches(&self) -> bool;
}

/// Runs a configured shell command, `wo clean --all` by default.
#[derive(Debug, Clone)]
pub struct ShellCacheController {
    command: String,
    timeout: Duration,
}

impl ShellCacheController {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }
}

impl CacheController for ShellCacheController {
    fn clear_all_caches(&self) -> bool {
        if self.command.trim().is_empty() {
            return true;
        }
        let result = run_with_timeout(
            Command::new("sh").arg("-c").arg(&self.command),
            self.timeout,
        );
        match result {
            Ok(out) if out.success => {
                info!(command = %self.command, "caches cleared");
                true
            }
            Ok(out) => {
                warn!(command = %self.command, error = %out.diagnostic(), "cache clear failed");
                false
            }
            Err(e) => {
                warn!(command = %self.command, error = %e, "cache clear failed");
                false
            }
        }
    }
}
