//! vault-intel CLI: nightly intelligence pass over a markdown research vault.
//!
//! Runs the agent pipeline (hygiene, cross-referencing, position risk,
//! holdings delta, briefing) once and exits.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    if let Err(report) = commands::run(cli).await {
        let code = commands::exit_code(&report);
        eprintln!("Error: {report:?}");
        std::process::exit(code);
    }
    Ok(())
}
