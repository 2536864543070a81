use crate::cmd::init::join_or_none;
use crate::cmd::print_rollout;
use crate::context::{confirm_rollout, with_fleet};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::{Args, Subcommand};
use std::path::Path;
use wpfleet_core::baseline::{Baseline, HistoryRef};
use wpfleet_core::config::GitHubSpec;
use wpfleet_core::fetch::ArtifactSource;
use wpfleet_core::fleet::Fleet;
use wpfleet_core::validate::Severity;

/// Where to fetch an artifact from when it is not in config.
#[derive(Args, Default)]
pub struct SourceArgs {
    /// GitHub repository (owner/repo)
    #[arg(long, conflicts_with = "url")]
    github: Option<String>,
    /// Branch to download (with --github)
    #[arg(long, requires = "github")]
    branch: Option<String>,
    /// Tag to download (with --github; wins over --branch)
    #[arg(long, requires = "github")]
    tag: Option<String>,
    /// Direct zip URL
    #[arg(long)]
    url: Option<String>,
}

impl SourceArgs {
    fn into_source(self) -> Option<ArtifactSource> {
        if let Some(repo) = self.github {
            return Some(
                GitHubSpec {
                    repo,
                    branch: self.branch,
                    tag: self.tag,
                }
                .to_source(),
            );
        }
        self.url.map(ArtifactSource::Url)
    }
}

#[derive(Subcommand)]
pub enum BaselineSubcommand {
    /// Show the current baseline
    Show,
    /// Fetch a plugin and add it to the baseline
    AddPlugin {
        slug: String,
        #[command(flatten)]
        source: SourceArgs,
        /// Roll the new baseline out immediately
        #[arg(long)]
        apply: bool,
    },
    /// Fetch a theme and make it the baseline theme
    AddTheme {
        slug: String,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        apply: bool,
    },
    /// Remove a plugin from the baseline (files stay installed)
    RemovePlugin {
        slug: String,
        #[arg(long)]
        apply: bool,
    },
    /// Switch the baseline to an installed theme
    SetTheme {
        slug: String,
        #[arg(long)]
        apply: bool,
    },
    /// Roll the current baseline out: staging first, then every production site
    Apply {
        /// Proceed without a staging site and without asking
        #[arg(long)]
        force: bool,
    },
    /// Show baseline history, newest first
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Show the git mirror log instead
        #[arg(long)]
        git: bool,
    },
    /// Restore an earlier baseline as a new version
    Rollback {
        /// Version number from history
        #[arg(long, conflicts_with = "to_commit", required_unless_present = "to_commit")]
        to_version: Option<u64>,
        /// Commit or tag in the git mirror
        #[arg(long)]
        to_commit: Option<String>,
        #[arg(long)]
        apply: bool,
    },
    /// Cross-check the baseline against installed artifacts and site state
    Validate,
}

impl BaselineSubcommand {
    /// Whether this invocation can start a rollout.
    pub fn rolls_out(&self) -> bool {
        match self {
            BaselineSubcommand::Apply { .. } => true,
            BaselineSubcommand::AddPlugin { apply, .. }
            | BaselineSubcommand::AddTheme { apply, .. }
            | BaselineSubcommand::RemovePlugin { apply, .. }
            | BaselineSubcommand::SetTheme { apply, .. }
            | BaselineSubcommand::Rollback { apply, .. } => *apply,
            _ => false,
        }
    }
}

pub fn run(config: &Path, subcmd: BaselineSubcommand, json: bool) -> anyhow::Result<()> {
    with_fleet(config, |fleet| match subcmd {
        BaselineSubcommand::Show => show(fleet, json),
        BaselineSubcommand::AddPlugin {
            slug,
            source,
            apply,
        } => {
            let b = fleet
                .add_plugin(&slug, source.into_source())
                .with_context(|| format!("failed to add plugin '{slug}'"))?;
            changed(fleet, &b, &format!("added plugin {slug}"), apply, json)
        }
        BaselineSubcommand::AddTheme {
            slug,
            source,
            apply,
        } => {
            let b = fleet
                .add_theme(&slug, source.into_source())
                .with_context(|| format!("failed to add theme '{slug}'"))?;
            changed(fleet, &b, &format!("theme set to {slug}"), apply, json)
        }
        BaselineSubcommand::RemovePlugin { slug, apply } => {
            let b = fleet.remove_plugin(&slug)?;
            changed(fleet, &b, &format!("removed plugin {slug}"), apply, json)
        }
        BaselineSubcommand::SetTheme { slug, apply } => {
            let b = fleet.set_theme(&slug)?;
            changed(fleet, &b, &format!("theme set to {slug}"), apply, json)
        }
        BaselineSubcommand::Apply { force } => {
            let report = fleet.apply(force, &confirm_rollout)?;
            if json {
                return print_json(&report);
            }
            print_rollout(&report);
            Ok(())
        }
        BaselineSubcommand::History { limit, git } => history(fleet, limit, git, json),
        BaselineSubcommand::Rollback {
            to_version,
            to_commit,
            apply,
        } => {
            let target = match (to_version, to_commit) {
                (Some(v), _) => HistoryRef::Version(v),
                (None, Some(c)) => HistoryRef::Commit(c),
                (None, None) => anyhow::bail!("pass --to-version or --to-commit"),
            };
            let b = fleet.baseline_rollback(&target)?;
            changed(fleet, &b, &format!("reverted to {target}"), apply, json)
        }
        BaselineSubcommand::Validate => validate(fleet, json),
    })
}

fn show(fleet: &Fleet<'_>, json: bool) -> anyhow::Result<()> {
    let b = fleet.baseline()?;
    if json {
        return print_json(&b);
    }
    println!("Baseline v{} (generated {})", b.version, b.generated.to_rfc3339());
    println!("  plugins: {}", join_or_none(&b.plugins));
    println!("  theme:   {}", b.theme.as_deref().unwrap_or("(none)"));
    if !b.options.is_empty() {
        println!("  options:");
        for (k, v) in &b.options {
            println!("    {k} = {v}");
        }
    }
    Ok(())
}

/// Report a mutation and optionally roll it out.
fn changed(
    fleet: &Fleet<'_>,
    baseline: &Baseline,
    what: &str,
    apply: bool,
    json: bool,
) -> anyhow::Result<()> {
    let report = if apply {
        Some(fleet.apply(false, &confirm_rollout)?)
    } else {
        None
    };
    if json {
        return print_json(&serde_json::json!({
            "baseline": baseline,
            "rollout": report,
        }));
    }
    println!("Baseline v{}: {what}", baseline.version);
    match report {
        Some(r) => print_rollout(&r),
        None => println!("Run 'wpfleet baseline apply' to roll it out."),
    }
    Ok(())
}

fn history(fleet: &Fleet<'_>, limit: usize, git: bool, json: bool) -> anyhow::Result<()> {
    if git {
        let commits = fleet.git_log(limit)?;
        if json {
            return print_json(&commits);
        }
        if commits.is_empty() {
            println!("No git history (git not installed or no commits yet).");
        }
        for c in commits {
            println!("{}  {}", c.sha, c.subject);
        }
        return Ok(());
    }

    let entries = fleet.history(limit)?;
    if json {
        return print_json(&entries);
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                format!("v{}", e.version),
                e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                e.summary.clone(),
                e.baseline.plugins.len().to_string(),
                e.baseline.theme.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["VERSION", "WHEN", "CHANGE", "PLUGINS", "THEME"], rows);
    Ok(())
}

fn validate(fleet: &Fleet<'_>, json: bool) -> anyhow::Result<()> {
    let report = fleet.validate()?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Baseline v{} (history head: {})",
            report.version,
            report
                .history_head
                .map(|v| format!("v{v}"))
                .unwrap_or_else(|| "none".to_string())
        );
        for (slug, version) in &report.plugin_versions {
            println!("  {slug} {version}");
        }
        if !report.unmanaged_plugins.is_empty() {
            println!("  not in baseline: {}", report.unmanaged_plugins.join(", "));
        }
        if !report.unmanaged_themes.is_empty() {
            println!("  themes not in baseline: {}", report.unmanaged_themes.join(", "));
        }
        if report.findings.is_empty() {
            println!("No problems found.");
        }
        for f in &report.findings {
            let tag = match f.severity {
                Severity::Error => "error",
                Severity::Warning => "warn ",
            };
            println!("  [{tag}] {}", f.message);
        }
    }
    if !report.is_valid() {
        anyhow::bail!("baseline validation failed");
    }
    Ok(())
}
