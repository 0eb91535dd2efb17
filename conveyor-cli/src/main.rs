// Conveyor CLI
// Runs pipeline definitions locally: job graph, image cache and branch-routed deploys

mod commands;
mod output;

use clap::Parser;
use color_eyre::Result;
use conveyor_engine::{ConveyorConfig, ServiceError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::Commands;

/// Exit code for pipelines that cannot be loaded or scheduled
pub const LOAD_ERROR_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "conveyor", version)]
#[command(about = "Run CI/CD pipeline definitions locally", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(long, short = 'v', global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = match ConveyorConfig::load() {
        Ok(config) => config,
        Err(e) => {
            output::load_error(&ServiceError::from(e));
            std::process::exit(LOAD_ERROR_EXIT_CODE);
        }
    };

    init_tracing(&cli, &config);

    commands::handle_command(cli.command, config).await
}

/// `RUST_LOG` wins; otherwise the flags, then the config file, then `info`
fn init_tracing(cli: &Cli, config: &ConveyorConfig) {
    let fallback = if cli.verbose {
        "conveyor=debug,conveyor_engine=debug".to_string()
    } else if cli.quiet {
        "warn".to_string()
    } else {
        config
            .log_level
            .clone()
            .unwrap_or_else(|| "conveyor=info,conveyor_engine=info".to_string())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}
