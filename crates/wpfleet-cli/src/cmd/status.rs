use crate::cmd::init::join_or_none;
use crate::context::with_fleet;
use crate::output::print_json;
use std::path::Path;

pub fn run(config: &Path, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let status = fleet.status()?;
        if json {
            return print_json(&status);
        }
        if !status.initialized {
            println!("Not initialized. Run: wpfleet init");
            return Ok(());
        }

        println!("Shared root:     {}", status.shared_root);
        println!(
            "Current release: {}",
            status.current_release.as_deref().unwrap_or("(none)")
        );
        if let Some(b) = &status.baseline {
            println!("Baseline:        v{}", b.version);
            println!("  plugins: {}", join_or_none(&b.plugins));
            println!("  theme:   {}", b.theme.as_deref().unwrap_or("(none)"));
        }

        println!("\nHealth:");
        for check in &status.health {
            let mark = if check.ok { "ok  " } else { "FAIL" };
            println!("  [{mark}] {}", check.name);
        }

        println!("\nReleases ({}):", status.releases.len());
        for r in status.releases.iter().take(3) {
            let marker = if r.current { " (current)" } else { "" };
            println!("  {}{marker}", r.id);
        }

        let s = &status.stats;
        println!(
            "\nSites: {} total, {} enabled, {} ssl, {} staging, {} quarantined",
            s.total_sites, s.enabled_sites, s.ssl_sites, s.staging_sites, s.quarantined_sites
        );
        if !s.php_distribution.is_empty() {
            let php: Vec<String> = s
                .php_distribution
                .iter()
                .map(|(v, n)| format!("{v}: {n}"))
                .collect();
            println!("  php:   {}", php.join(", "));
        }
        if !s.cache_distribution.is_empty() {
            let cache: Vec<String> = s
                .cache_distribution
                .iter()
                .map(|(v, n)| format!("{v}: {n}"))
                .collect();
            println!("  cache: {}", cache.join(", "));
        }
        Ok(())
    })
}
