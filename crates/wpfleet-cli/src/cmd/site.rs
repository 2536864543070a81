use crate::context::with_fleet;
use crate::output::{print_json, print_table, yes_no};
use clap::Subcommand;
use std::path::Path;
use wpfleet_core::registry::NewSite;

#[derive(Subcommand)]
pub enum SiteSubcommand {
    /// Add a provisioned site to the fleet registry
    Register {
        domain: String,
        /// WordPress root of the site (default: /var/www/<domain>/htdocs)
        #[arg(long)]
        path: Option<String>,
        /// PHP version (default: from config)
        #[arg(long)]
        php: Option<String>,
        /// Cache type (wpfc, wpredis, wpsc, basic)
        #[arg(long, default_value = "basic")]
        cache: String,
        /// Site is served over HTTPS
        #[arg(long)]
        ssl: bool,
    },
    /// Remove a site from the registry (files are left alone)
    Remove { domain: String },
    /// List registered sites
    List,
    /// Include a site in rollouts again
    Enable { domain: String },
    /// Exclude a site from rollouts
    Disable { domain: String },
    /// Show the plugins a site reports as active, against the baseline
    Plugins { domain: String },
}

pub fn run(config: &Path, subcmd: SiteSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SiteSubcommand::Register {
            domain,
            path,
            php,
            cache,
            ssl,
        } => register(config, domain, path, php, cache, ssl, json),
        SiteSubcommand::Remove { domain } => remove(config, &domain, json),
        SiteSubcommand::List => list(config, json),
        SiteSubcommand::Enable { domain } => set_enabled(config, &domain, true, json),
        SiteSubcommand::Disable { domain } => set_enabled(config, &domain, false, json),
        SiteSubcommand::Plugins { domain } => plugins(config, &domain, json),
    }
}

fn register(
    config: &Path,
    domain: String,
    path: Option<String>,
    php: Option<String>,
    cache: String,
    ssl: bool,
    json: bool,
) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let site_path = path.unwrap_or_else(|| format!("/var/www/{domain}/htdocs"));
        let php_version = php.unwrap_or_else(|| fleet.config().php_version.clone());
        let site = fleet.register_site(NewSite {
            domain,
            site_path,
            php_version,
            cache_type: cache,
            is_ssl: ssl,
            shared_release: None,
        })?;
        if json {
            return print_json(&site);
        }
        println!("Registered {} ({})", site.domain, site.site_path);
        Ok(())
    })
}

fn remove(config: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        fleet.remove_site(domain)?;
        if json {
            return print_json(&serde_json::json!({ "removed": domain }));
        }
        println!("Removed {domain}");
        Ok(())
    })
}

fn set_enabled(config: &Path, domain: &str, enabled: bool, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        fleet.set_site_enabled(domain, enabled)?;
        if json {
            return print_json(&serde_json::json!({ "domain": domain, "enabled": enabled }));
        }
        let state = if enabled { "enabled" } else { "disabled" };
        println!("{domain} {state}");
        Ok(())
    })
}

fn list(config: &Path, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let sites = fleet.sites()?;
        if json {
            return print_json(&sites);
        }
        if sites.is_empty() {
            println!("No sites registered.");
            return Ok(());
        }
        let rows = sites
            .iter()
            .map(|s| {
                let state = if s.is_quarantined {
                    "quarantined"
                } else if !s.is_enabled {
                    "disabled"
                } else if s.is_staging {
                    "staging"
                } else {
                    "active"
                };
                vec![
                    s.domain.clone(),
                    s.php_version.clone(),
                    s.cache_type.clone(),
                    yes_no(s.is_ssl),
                    format!("v{}", s.baseline_version),
                    state.to_string(),
                ]
            })
            .collect();
        print_table(&["DOMAIN", "PHP", "CACHE", "SSL", "BASELINE", "STATE"], rows);
        println!("\n{} site(s)", sites.len());
        Ok(())
    })
}

fn plugins(config: &Path, domain: &str, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let report = fleet.site_plugins(domain)?;
        if json {
            return print_json(&report);
        }
        let rows = report
            .plugins
            .iter()
            .map(|p| vec![p.name.clone(), p.status.clone(), p.version.clone()])
            .collect();
        print_table(&["PLUGIN", "STATUS", "VERSION"], rows);
        if report.inactive_baseline.is_empty() {
            println!("\n{} matches baseline v{}", report.domain, report.baseline_version);
        } else {
            println!(
                "\nnot active from baseline v{}: {}",
                report.baseline_version,
                report.inactive_baseline.join(", ")
            );
        }
        Ok(())
    })
}
