//! CLI entry and dispatch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use vmload_core::config::{self, Config};

use crate::logging;

mod commands;

#[derive(Parser)]
#[command(name = "vmload")]
#[command(version = "0.1")]
#[command(about = "Run view-model session loading scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of $VMLOAD_HOME/config.toml
    #[arg(long, global = true, env = "VMLOAD_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the sessions of a scenario file against its view-model
    Run {
        /// Path to the scenario TOML file
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,

        /// Start every session at once instead of one after another
        #[arg(long)]
        concurrent: bool,

        /// Exit non-zero as soon as a session fails without being handled
        #[arg(long)]
        fail_fast: bool,

        /// Print events and the summary as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Validate a scenario file without running it
    Check {
        /// Path to the scenario TOML file
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Print the effective configuration
    Show,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::paths::config_path);
    let config = Config::load_from(&config_path).context("load config")?;
    let _log_guard = logging::init(&config.log_level, cli.verbose, config.log_file.as_deref())?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli.command, &config_path, &config).await })
}

async fn dispatch(command: Commands, config_path: &Path, config: &Config) -> Result<()> {
    match command {
        Commands::Run {
            scenario,
            concurrent,
            fail_fast,
            json,
        } => {
            commands::run::run(commands::run::RunOptions {
                scenario: &scenario,
                config,
                concurrent,
                fail_fast,
                json,
            })
            .await
        }
        Commands::Check { scenario } => commands::run::check(&scenario),
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path(config_path);
                Ok(())
            }
            ConfigCommands::Show => commands::config::show(config),
        },
    }
}
