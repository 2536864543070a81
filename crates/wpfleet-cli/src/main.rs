mod cmd;
mod context;
mod output;

use clap::{Parser, Subcommand};
use cmd::{
    baseline::BaselineSubcommand, release::ReleaseSubcommand, site::SiteSubcommand,
    staging::StagingSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "wpfleet",
    about = "Shared-core WordPress fleet management: baselines, core releases and staged rollouts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: /etc/wpfleet/config.yaml)
    #[arg(long, global = true, env = "WPFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shared root, download the first core release and write baseline v1
    Init {
        /// Reinitialize an existing fleet (baseline history is kept)
        #[arg(long)]
        force: bool,
    },

    /// Download a new WordPress core release and switch the fleet to it
    Update {
        /// Keep the new release even if the canary probe fails
        #[arg(long)]
        force: bool,
    },

    /// Switch the fleet back to the previous core release
    Rollback {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Manage the baseline plugin/theme set and roll it out
    Baseline {
        #[command(subcommand)]
        subcommand: BaselineSubcommand,
    },

    /// Register and manage tenant sites
    Site {
        #[command(subcommand)]
        subcommand: SiteSubcommand,
    },

    /// Designate the staging site used to test rollouts
    Staging {
        #[command(subcommand)]
        subcommand: StagingSubcommand,
    },

    /// Clear a site's quarantine and re-apply the current baseline to it
    Unquarantine { domain: String },

    /// Infrastructure status and health checks
    Status,

    /// Inspect core releases
    Release {
        #[command(subcommand)]
        subcommand: ReleaseSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Init { .. }
        | Commands::Update { .. }
        | Commands::Rollback { .. }
        | Commands::Unquarantine { .. } => tracing::Level::INFO,
        Commands::Baseline { subcommand } if subcommand.rolls_out() => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = context::resolve_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Init { force } => cmd::init::run(&config, force, cli.json),
        Commands::Update { force } => cmd::update::run(&config, force, cli.json),
        Commands::Rollback { force } => cmd::rollback::run(&config, force, cli.json),
        Commands::Baseline { subcommand } => cmd::baseline::run(&config, subcommand, cli.json),
        Commands::Site { subcommand } => cmd::site::run(&config, subcommand, cli.json),
        Commands::Staging { subcommand } => cmd::staging::run(&config, subcommand, cli.json),
        Commands::Unquarantine { domain } => cmd::unquarantine::run(&config, &domain, cli.json),
        Commands::Status => cmd::status::run(&config, cli.json),
        Commands::Release { subcommand } => cmd::release::run(&config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
