use crate::context::with_fleet;
use crate::output::{print_json, print_table};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ReleaseSubcommand {
    /// List core releases, newest first
    List,
}

pub fn run(config: &Path, subcmd: ReleaseSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ReleaseSubcommand::List => list(config, json),
    }
}

fn list(config: &Path, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| {
        let releases = fleet.list_releases()?;
        if json {
            return print_json(&releases);
        }
        if releases.is_empty() {
            println!("No releases.");
            return Ok(());
        }
        let rows = releases
            .iter()
            .map(|r| {
                vec![
                    r.id.clone(),
                    if r.current { "*".to_string() } else { String::new() },
                ]
            })
            .collect();
        print_table(&["RELEASE", "CURRENT"], rows);
        Ok(())
    })
}
