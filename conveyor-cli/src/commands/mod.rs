// CLI commands
// Subcommand definitions and dispatch

mod cache;
mod route;
mod run;
mod validate;

pub use cache::CacheCommands;
pub use route::RouteArgs;
pub use run::RunArgs;
pub use validate::ValidateArgs;

use clap::Subcommand;
use color_eyre::Result;
use conveyor_engine::ConveyorConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline for a branch and revision
    Run(RunArgs),
    /// Check a pipeline file without running anything
    Validate(ValidateArgs),
    /// Show where a branch would deploy
    Route(RouteArgs),
    /// Inspect or clean the artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

pub async fn handle_command(command: Commands, config: ConveyorConfig) -> Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, config).await,
        Commands::Validate(args) => validate::execute(args),
        Commands::Route(args) => route::execute(args),
        Commands::Cache { command } => cache::execute(command, config).await,
    }
}
