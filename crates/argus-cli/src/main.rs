mod cmd;
mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "argus",
    about = "Track service releases and act on new versions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file
    #[arg(long, short = 'c', global = true, env = "ARGUS_CONFIG", default_value = "config.yml")]
    config: PathBuf,

    /// Log level (overrides settings.log.level)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Track every configured service until interrupted (default)
    Run,

    /// Load and validate the config, then list its services
    Check,
}

/// Install the global subscriber. A valid `RUST_LOG` filter takes
/// precedence over `level`.
pub(crate) fn init_logging(level: &str) -> anyhow::Result<()> {
    let level = level
        .parse::<tracing::Level>()
        .map_err(|_| anyhow::anyhow!("invalid log level {level:?}"))?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::default().add_directive(level.into()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd::run::run(&cli.config, cli.log_level.as_deref()),
        Commands::Check => cmd::check::run(&cli.config, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
