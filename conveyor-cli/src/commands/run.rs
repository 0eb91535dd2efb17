use crate::output;
use crate::LOAD_ERROR_EXIT_CODE;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tracing::{debug, warn};

use conveyor_engine::artifacts::{self, FsArtifactStore, RunSummary};
use conveyor_engine::execution::events::progress_channel;
use conveyor_engine::runners::{ContainerConfig, ImagePullPolicy};
use conveyor_engine::utils::{plan_run, RunPlan};
use conveyor_engine::{
    ArtifactCache, ContainerRunner, ConveyorConfig, Deployer, DockerRegistry, EnvironmentSnapshot,
    FsCacheStore, JobExecutor, KubectlClient, PipelineScheduler, RunnerRegistry, SchedulerConfig,
};

/// Run a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Branch being built (default: $CONVEYOR_BRANCH, then git)
    #[arg(long, short = 'b', value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Revision being built (default: $CONVEYOR_REVISION, then git)
    #[arg(long, short = 'r', value_name = "REV")]
    pub revision: Option<String>,

    /// Working directory for execution (default: the checkout holding the pipeline)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Maximum jobs running at once (0 = unlimited)
    #[arg(long, short = 'j', value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Keep starting independent jobs after a failure
    #[arg(long)]
    pub keep_going: bool,

    /// Run steps inside their job's image
    #[arg(long)]
    pub containers: bool,

    /// When to pull job images: always, if-not-present or never
    #[arg(long, value_name = "POLICY")]
    pub pull: Option<ImagePullPolicy>,

    /// Extra `docker run` argument (repeatable)
    #[arg(long = "docker-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub docker_args: Vec<String>,

    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    pub artifact_dir: Option<PathBuf>,

    /// kubectl context used by deploy steps
    #[arg(long, value_name = "NAME")]
    pub kube_context: Option<String>,
}

pub async fn execute(args: RunArgs, config: ConveyorConfig) -> Result<()> {
    if !args.pipeline.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", args.pipeline.display());
    }

    output::status("Parsing", &format!("{}", args.pipeline.display()));
    let plan = plan_run(
        &args.pipeline,
        args.working_dir.clone().or_else(|| config.work_dir.clone()),
        args.branch.clone(),
        args.revision.clone(),
    )
    .await;
    let RunPlan {
        pipeline,
        graph,
        work_dir,
        trigger,
    } = match plan {
        Ok(plan) => plan,
        Err(e) => {
            output::load_error(&e);
            std::process::exit(LOAD_ERROR_EXIT_CODE);
        }
    };

    let env = Arc::new(EnvironmentSnapshot::capture(trigger));
    output::info(&format!(
        "branch {} at {} in {}",
        env.branch(),
        env.revision(),
        work_dir.display()
    ));

    let cache_dir = args.cache_dir.clone().unwrap_or_else(|| config.cache_dir());
    let cache = ArtifactCache::new(Arc::new(FsCacheStore::new(&cache_dir)));

    let artifact_store = Arc::new(FsArtifactStore::new(
        args.artifact_dir.clone().unwrap_or_else(|| config.artifact_dir()),
        &artifacts::run_id(env.revision()),
    ));
    debug!(cache = %cache_dir.display(), artifacts = %artifact_store.run_dir().display(), "storage");

    let mut runner = RunnerRegistry::new();
    if args.containers || config.containers() {
        let container = ContainerRunner::with_config(container_config(&args, &config));
        if container.is_available().await {
            runner = runner.with_container_runner(container);
        } else {
            warn!("docker is not available; running steps on the host");
            output::warning("docker is not available; running steps on the host");
        }
    }

    let mut executor = JobExecutor::new(
        env.clone(),
        &work_dir,
        Arc::new(runner),
        cache,
        artifact_store.clone(),
        Arc::new(DockerRegistry::new()),
    )
    .with_pipeline_env(pipeline.env.clone());

    if let Some(deploy) = &pipeline.deploy {
        let mut client = KubectlClient::new();
        if let Some(context) = &args.kube_context {
            client = client.with_context(context);
        }
        executor = executor.with_deployer(Deployer::new(deploy, &work_dir, Arc::new(client)));
    }

    let scheduler_config = SchedulerConfig {
        max_parallel_jobs: args.max_parallel.unwrap_or_else(|| config.max_parallel_jobs()),
        fail_fast: !args.keep_going && config.fail_fast(),
    };

    let (tx, mut rx) = progress_channel();
    let name = pipeline.name.clone().unwrap_or_else(|| "pipeline".to_string());
    let scheduler = PipelineScheduler::new(name, graph, executor)
        .with_config(scheduler_config)
        .with_progress(tx);

    // Spawn execution in background; the channel closes when the scheduler is dropped
    let exec_handle = tokio::spawn(async move { scheduler.run().await });

    while let Some(event) = rx.recv().await {
        output::render(&event);
    }

    let result = exec_handle.await?;

    let summary = RunSummary::new(&result, env.branch(), env.revision());
    match artifact_store.write_summary(&summary).await {
        Ok(path) => output::dim(&format!("  summary: {}", path.display())),
        Err(e) => warn!(error = %e, "could not write run summary"),
    }

    if !result.success {
        output::run_failures(&result);
        std::process::exit(result.exit_code());
    }

    Ok(())
}

/// Flags override the config file
fn container_config(args: &RunArgs, config: &ConveyorConfig) -> ContainerConfig {
    let mut containers = config.container_config();
    if let Some(policy) = args.pull {
        containers.pull_policy = policy;
    }
    if !args.docker_args.is_empty() {
        containers.extra_args = args.docker_args.clone();
    }
    containers
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(argv: &[&str]) -> RunArgs {
        Harness::parse_from(std::iter::once("conveyor").chain(argv.iter().copied())).run
    }

    #[test]
    fn test_container_flags_override_config() {
        let config = ConveyorConfig {
            container_pull: Some(ImagePullPolicy::Never),
            container_args: Some(vec!["--network".to_string(), "host".to_string()]),
            ..Default::default()
        };

        let from_config = container_config(&parse(&["p.yaml"]), &config);
        assert_eq!(from_config.pull_policy, ImagePullPolicy::Never);
        assert_eq!(from_config.extra_args, ["--network", "host"]);

        let args = parse(&["p.yaml", "--pull", "always", "--docker-arg", "--privileged"]);
        let from_flags = container_config(&args, &config);
        assert_eq!(from_flags.pull_policy, ImagePullPolicy::Always);
        assert_eq!(from_flags.extra_args, ["--privileged"]);
    }
}
