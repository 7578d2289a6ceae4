//! MailProof CLI - Main Entry Point
//!
//! Manages the email client catalog, submits render jobs, feeds worker results back in
//! and reports on the outcome.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod config;
mod output;

use commands::{clients, job, report, Context};
use config::MailProofConfig;

/// MailProof CLI - Email Render Testing
#[derive(Parser)]
#[command(name = "mailproof")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "MAILPROOF_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory (overrides the configuration file)
    #[arg(long, env = "MAILPROOF_STORE", global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage email clients
    #[command(subcommand)]
    Clients(clients::ClientsCommands),

    /// Manage render jobs
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Show the test report for a job
    Report(report::ReportArgs),

    /// Write the effective configuration to the configuration file
    Init,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = MailProofConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Commands::Version => {
            println!("MailProof CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Core library v{}", mailproof_common::VERSION);
        }
        Commands::Init => {
            config.save(&config_path)?;
            output::print_success(
                &format!("Configuration written to {}", config_path.display()),
                cli.format,
            );
        }
        Commands::Clients(cmd) => clients::execute(cmd, &Context::open(config, cli.format)?)?,
        Commands::Job(cmd) => job::execute(cmd, &Context::open(config, cli.format)?).await?,
        Commands::Report(args) => report::execute(args, &Context::open(config, cli.format)?)?,
    }

    Ok(())
}
