//! sshubl CLI
//!
//! Opens an OpenSSH control master to a host and multiplexes port forwards,
//! sshfs mounts and interactive shells over it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshubl::commands::{self, UpArgs};
use sshubl_core::config;

#[derive(Parser)]
#[command(name = "sshubl")]
#[command(author, version, about = "Multiplexed SSH sessions with forwards and mounts")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "SSHUBL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a host, set up forwards and mounts, and hold them until Ctrl-C
    Up(UpArgs),

    /// Open an interactive shell over the host's control master
    Shell {
        /// Connection string: [user[:password]@]host[:port]
        target: String,
    },

    /// Check whether a control master is running for a host
    Check {
        /// Connection string: [user@]host[:port]
        target: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Initialize default configuration
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    match cli.command {
        Commands::Up(args) => {
            let settings = load_settings(&config_path)?;
            commands::up_command(settings, args).await?;
        }

        Commands::Shell { target } => {
            let settings = load_settings(&config_path)?;
            commands::shell_command(settings, &target).await?;
        }

        Commands::Check { target } => {
            let settings = load_settings(&config_path)?;
            if !commands::check_command(&settings, &target).await? {
                std::process::exit(1);
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&config_path)?,
            ConfigAction::Init { force } => commands::config_init(&config_path, force)?,
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}

fn load_settings(path: &std::path::Path) -> Result<sshubl_core::Settings> {
    config::load_settings(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}
