use crate::context::with_fleet;
use crate::output::print_json;
use std::path::Path;
use wpfleet_core::applicator::SiteOutcome;

pub fn run(config: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let outcome = fleet.unquarantine(domain)?;
        if json {
            print_json(&outcome)?;
        } else {
            match &outcome {
                SiteOutcome::Applied { domain, version } => {
                    println!("{domain}: baseline v{version} applied, quarantine cleared")
                }
                SiteOutcome::Quarantined { domain, reason } => {
                    println!("{domain}: still failing, quarantined again: {reason}")
                }
            }
        }
        if matches!(outcome, SiteOutcome::Quarantined { .. }) {
            anyhow::bail!("re-apply failed on {domain}");
        }
        Ok(())
    })
}
