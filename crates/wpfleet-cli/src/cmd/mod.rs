pub mod baseline;
pub mod init;
pub mod release;
pub mod rollback;
pub mod site;
pub mod staging;
pub mod status;
pub mod unquarantine;
pub mod update;

use wpfleet_core::applicator::{RolloutReport, StagingOutcome};

/// Human-readable rollout summary shared by `baseline apply` and the `--apply` flags.
pub(crate) fn print_rollout(report: &RolloutReport) {
    match &report.staging {
        StagingOutcome::Passed { domain } => println!("Staging test passed on {domain}"),
        StagingOutcome::Skipped => println!("Staging test skipped (no staging site)"),
    }
    println!("Baseline v{}: {}", report.version, report.summary());
    for q in &report.quarantined {
        println!("  quarantined {}: {}", q.domain, q.reason);
    }
    if !report.cache_cleared {
        println!("warning: cache clear failed");
    }
}
