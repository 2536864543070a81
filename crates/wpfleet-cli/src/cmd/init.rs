use crate::context::with_fleet;
use crate::output::print_json;
use std::path::Path;

pub fn run(config: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let report = fleet.init(force)?;
        if json {
            return print_json(&report);
        }
        println!(
            "Initialized shared root: {}",
            fleet.config().shared_root.display()
        );
        let how = if report.downloaded_release {
            "downloaded"
        } else {
            "kept"
        };
        println!("  release:  {} ({how})", report.release);
        println!("  baseline: v{}", report.baseline_version);
        println!("  plugins:  {}", join_or_none(&report.plugins));
        println!(
            "  theme:    {}",
            report.theme.as_deref().unwrap_or("(none)")
        );
        println!("  enforcer: {}", report.enforcer);
        if !report.skipped.is_empty() {
            println!("  skipped:  {} (could not be fetched)", report.skipped.join(", "));
        }
        Ok(())
    })
}

pub(crate) fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}
