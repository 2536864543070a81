use crate::context::with_fleet;
use crate::output::print_json;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum StagingSubcommand {
    /// Make a site the staging site (replaces any existing one)
    Set { domain: String },
    /// Remove the staging flag from a site
    Unset { domain: String },
    /// Show the current staging site
    Show,
}

pub fn run(config: &Path, subcmd: StagingSubcommand, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| match subcmd {
        StagingSubcommand::Set { domain } => {
            let previous = fleet.set_staging(&domain)?;
            if json {
                return print_json(&serde_json::json!({
                    "staging": domain,
                    "previous": previous,
                }));
            }
            match previous {
                Some(p) => println!("Staging site: {domain} (replaces {p})"),
                None => println!("Staging site: {domain}"),
            }
            Ok(())
        }
        StagingSubcommand::Unset { domain } => {
            fleet.unset_staging(&domain)?;
            if json {
                return print_json(&serde_json::json!({ "unset": domain }));
            }
            println!("{domain} is no longer the staging site");
            Ok(())
        }
        StagingSubcommand::Show => {
            let site = fleet.registry().staging_site()?;
            if json {
                return print_json(&site);
            }
            match site {
                Some(s) => println!("{}", s.domain),
                None => println!("No staging site"),
            }
            Ok(())
        }
    })
}
