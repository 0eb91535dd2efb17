use crate::output;
use crate::LOAD_ERROR_EXIT_CODE;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_engine::execution::graph::JobGraph;
use conveyor_engine::{PipelineParser, PipelineValidator, ServiceError};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Validating", &format!("{}", pipeline_path.display()));

    let pipeline = match PipelineParser::parse_file(pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            output::load_error(&ServiceError::from(e));
            std::process::exit(LOAD_ERROR_EXIT_CODE);
        }
    };

    output::check("YAML syntax valid");

    let steps_count: usize = pipeline.jobs.iter().map(|j| j.steps.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} steps",
        pipeline.jobs.len(),
        steps_count
    ));

    if let Err(errors) = PipelineValidator::validate(&pipeline) {
        output::error(&format!("{} validation error(s):", errors.len()));
        for error in &errors {
            output::error(&format!("  - [{}] {}", error.path, error.message));
            if let Some(suggestion) = &error.suggestion {
                output::info(&format!("    Suggestion: {}", suggestion));
            }
        }
        std::process::exit(LOAD_ERROR_EXIT_CODE);
    }
    output::check("Semantic validation passed");

    match JobGraph::from_pipeline(&pipeline) {
        Ok(graph) => {
            let levels = graph.parallel_levels();
            output::check(&format!(
                "Job graph: {} jobs in {} levels",
                graph.len(),
                levels.len()
            ));
            for (depth, level) in levels.iter().enumerate() {
                let names: Vec<&str> = level.iter().map(|node| node.name()).collect();
                output::dim(&format!("      {}: {}", depth, names.join(", ")));
            }
        }
        Err(e) => {
            output::load_error(&ServiceError::from(e));
            std::process::exit(LOAD_ERROR_EXIT_CODE);
        }
    }

    if let Some(deploy) = &pipeline.deploy {
        output::check(&format!(
            "Deploy: {} route(s), template {}",
            deploy.routes.len(),
            deploy.template
        ));
    }

    println!();
    output::check("Pipeline is valid");

    Ok(())
}
