//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use vaultintel_core::{Coordinator, PipelineOutcome, ProgressReporter};
use vaultintel_shared::{
    AgentKind, AgentReport, AgentResult, AppConfig, Status, VaultIntelError, init_config,
    load_config, load_config_from,
};

/// Exit status for a run that stopped before any agent could execute
/// (bad config, unsafe root, another run holding the lock).
const EXIT_FATAL: i32 = 2;
const EXIT_ERROR: i32 = 1;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// vault-intel: nightly vault hygiene, linking, risk checks and briefing.
#[derive(Parser)]
#[command(
    name = "vault-intel",
    version,
    about = "Run the nightly intelligence agents over a markdown research vault.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.vault-intel/vault-intel.toml).
    #[arg(long, global = true, env = "VAULT_INTEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full pipeline once.
    Run {
        /// Report what would change without writing to the vault or notifying.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a single agent outside the pipeline.
    Agent {
        /// hygiene, cross-reference, position-risk, holdings-delta or briefing.
        name: String,

        #[arg(long)]
        dry_run: bool,
    },

    /// Rebuild and export the reference index.
    Index,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "vaultintel=info",
        1 => "vaultintel=debug",
        _ => "vaultintel=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { dry_run } => cmd_run(config_path, dry_run).await,
        Command::Agent { name, dry_run } => cmd_agent(config_path, &name, dry_run).await,
        Command::Index => cmd_index(config_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

/// Map a command error to the process exit status.
pub(crate) fn exit_code(report: &Report) -> i32 {
    match report.downcast_ref::<VaultIntelError>() {
        Some(e) if e.is_fatal() => EXIT_FATAL,
        _ => EXIT_ERROR,
    }
}

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn coordinator(path: Option<&Path>) -> Result<Coordinator> {
    Ok(Coordinator::new(read_config(path)?)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, dry_run: bool) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    info!(dry_run, vault = %coordinator.paths().vault.display(), "running pipeline");

    let reporter = CliProgress::new();
    let outcome = coordinator.run(dry_run, &reporter).await?;

    print_outcome(&outcome);
    Ok(())
}

async fn cmd_agent(config_path: Option<&Path>, name: &str, dry_run: bool) -> Result<()> {
    let agent: AgentKind = name.parse()?;
    let coordinator = coordinator(config_path)?;
    info!(%agent, dry_run, "running single agent");

    let reporter = CliProgress::new();
    let result = coordinator.run_single(agent, dry_run, &reporter).await?;
    reporter.spinner.finish_and_clear();

    println!();
    print_result(&result);
    for issue in result.issues.iter().filter(|i| i.severity.is_critical()) {
        println!("    [{}] {}", issue.severity, issue.detail);
    }
    for error in &result.errors {
        println!("    error: {error}");
    }
    if let Some(AgentReport::Briefing(summary)) = &result.report {
        println!("  {}", summary.summary);
    }
    println!();
    Ok(())
}

async fn cmd_index(config_path: Option<&Path>) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    let index = coordinator.rebuild_index().await?;
    println!(
        "Indexed {} referenced notes into {}",
        index.len(),
        coordinator.paths().index_export_path().display()
    );
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => write_default_config(path)?,
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    println!("Edit the [paths] section before the first run.");
    Ok(())
}

fn write_default_config(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Err(eyre!("refusing to overwrite existing config at {}", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&AppConfig::default())?)?;
    Ok(path.to_path_buf())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = read_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_result(result: &AgentResult) {
    let elapsed = result
        .elapsed()
        .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "-".into());
    println!(
        "  {:<16} {:<8} issues={:<4} critical={:<3} actions={:<4} errors={:<3} {elapsed}",
        result.agent.to_string(),
        result.status.to_string(),
        result.issues.len(),
        result.critical_issue_count(),
        result.actions_taken.len(),
        result.errors.len(),
    );
}

fn print_outcome(outcome: &PipelineOutcome) {
    println!();
    println!(
        "  Run {}{}",
        outcome.run_id,
        if outcome.dry_run { " (dry run)" } else { "" }
    );
    println!("  Indexed notes: {}", outcome.index_size);
    println!();
    for result in outcome.results.values() {
        print_result(result);
    }
    println!();
    if let Some(summary) = &outcome.summary {
        println!("  {summary}");
    }
    if let Some(path) = &outcome.briefing_path {
        println!("  Report:   {}", path.display());
    }
    if outcome.notified {
        println!("  Notification sent");
    }
    let failed = outcome.failed_agents();
    if !failed.is_empty() {
        let names: Vec<String> = failed.iter().map(|a| a.to_string()).collect();
        println!("  Failed:   {}", names.join(", "));
    }
    println!("  Time:     {:.1}s", outcome.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn agent_started(&self, agent: AgentKind) {
        debug!(%agent, "agent scheduled");
    }

    fn agent_finished(&self, result: &AgentResult) {
        let mark = match result.status {
            Status::Success => "✓",
            Status::Partial => "~",
            Status::Failed => "✗",
        };
        self.spinner.println(format!(
            "  {mark} {} ({} issues)",
            result.agent,
            result.issues.len()
        ));
    }

    fn done(&self, _outcome: &PipelineOutcome) {
        self.spinner.finish_and_clear();
    }
}
