use crate::context::with_fleet;
use crate::output::print_json;
use std::path::Path;

pub fn run(config: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let report = fleet.update(force)?;
        if json {
            return print_json(&report);
        }
        println!(
            "Switched to {} (was {})",
            report.release,
            report.previous.as_deref().unwrap_or("none")
        );
        match &report.canary {
            Some(c) if c.passed => println!("  canary {}: {}", c.domain, c.detail),
            Some(c) => println!("  canary {} FAILED: {} (kept because of --force)", c.domain, c.detail),
            None => println!("  canary: no site to probe"),
        }
        println!("  sites updated: {}", report.sites_updated);
        if !report.refreshed.is_empty() {
            println!("  refreshed: {}", report.refreshed.join(", "));
        }
        if !report.refresh_failed.is_empty() {
            println!("  refresh failed (kept installed copy): {}", report.refresh_failed.join(", "));
        }
        println!("  baseline: v{}", report.baseline_version);
        if !report.removed_releases.is_empty() {
            println!("  removed: {}", report.removed_releases.join(", "));
        }
        if !report.cache_cleared {
            println!("warning: cache clear failed");
        }
        Ok(())
    })
}
