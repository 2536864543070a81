use crate::context::{confirm, with_fleet};
use crate::output::print_json;
use std::path::Path;

pub fn run(config: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let report = fleet.rollback(force, &confirm)?;
        if json {
            return print_json(&report);
        }
        println!("Rolled back: {} -> {}", report.from, report.to);
        if !report.cache_cleared {
            println!("warning: cache clear failed");
        }
        Ok(())
    })
}
