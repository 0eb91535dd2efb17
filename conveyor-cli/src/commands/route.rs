use crate::output;
use crate::LOAD_ERROR_EXIT_CODE;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_engine::{DeploymentRouter, PipelineParser, ServiceError};

/// Print the deployment target for one or more branches
#[derive(Args, Debug)]
pub struct RouteArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Branches to route
    #[arg(required = true)]
    pub branches: Vec<String>,
}

pub fn execute(args: RouteArgs) -> Result<()> {
    let pipeline = match PipelineParser::load(&args.pipeline) {
        Ok(p) => p,
        Err(e) => {
            output::load_error(&ServiceError::from(e));
            std::process::exit(LOAD_ERROR_EXIT_CODE);
        }
    };

    let Some(deploy) = &pipeline.deploy else {
        output::warning("pipeline has no deploy table; nothing to route");
        return Ok(());
    };

    let router = DeploymentRouter::new(deploy);
    for branch in &args.branches {
        let target = router.route(branch);
        if target.is_noop() {
            output::dim(&format!("  {}", target));
        } else {
            println!("  {}", target);
        }
    }

    Ok(())
}
