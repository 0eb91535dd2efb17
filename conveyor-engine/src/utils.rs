// Utility Functions
// Work directory and trigger discovery for a run

use crate::config::ConfigError;
use crate::error::ServiceResult;
use crate::execution::context::{BRANCH_VAR, REVISION_VAR};
use crate::execution::graph::JobGraph;
use crate::parser::models::{Pipeline, TriggerEvent};
use crate::parser::PipelineParser;

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Nearest ancestor of `start` holding a `.git` entry. Worktrees and
/// submodules use a `.git` file, so files count too.
pub fn checkout_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Directory jobs run in for `pipeline_file`.
///
/// An explicit directory (flag or config) wins. Otherwise it is the checkout
/// holding the pipeline file, so `conveyor run ci/pipeline.yaml` behaves the
/// same from any directory, and finally the pipeline file's own directory.
pub fn resolve_work_dir(pipeline_file: &Path, explicit: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir;
    }
    let file_dir = match pipeline_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    checkout_root(&file_dir).unwrap_or(file_dir)
}

/// Everything settled before the first job starts
#[derive(Debug)]
pub struct RunPlan {
    pub pipeline: Pipeline,
    pub graph: JobGraph,
    pub work_dir: PathBuf,
    pub trigger: TriggerEvent,
}

/// Load and validate the pipeline, build its job graph, then resolve the
/// work directory and trigger. Any error here means no job has run.
pub async fn plan_run(
    pipeline_file: &Path,
    work_dir: Option<PathBuf>,
    branch: Option<String>,
    revision: Option<String>,
) -> ServiceResult<RunPlan> {
    let pipeline = PipelineParser::load(pipeline_file)?;
    let graph = JobGraph::from_pipeline(&pipeline)?;
    let work_dir = resolve_work_dir(pipeline_file, work_dir);
    let trigger = resolve_trigger(branch, revision, &work_dir).await?;
    debug!(jobs = graph.len(), work_dir = %work_dir.display(), "run planned");

    Ok(RunPlan {
        pipeline,
        graph,
        work_dir,
        trigger,
    })
}

/// Work out the branch and revision being built.
///
/// Each value comes from the explicit argument, then the `CONVEYOR_BRANCH` /
/// `CONVEYOR_REVISION` variables, then `git` in `repo`.
pub async fn resolve_trigger(
    branch: Option<String>,
    revision: Option<String>,
    repo: &Path,
) -> Result<TriggerEvent, ConfigError> {
    resolve_trigger_with(branch, revision, repo, |name| std::env::var(name).ok()).await
}

pub async fn resolve_trigger_with<F>(
    branch: Option<String>,
    revision: Option<String>,
    repo: &Path,
    lookup: F,
) -> Result<TriggerEvent, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let from_env = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let branch = match branch.or_else(|| from_env(BRANCH_VAR)) {
        Some(branch) => branch,
        None => git_output(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .ok_or_else(|| ConfigError::MissingTrigger {
                what: "branch".to_string(),
                hint: format!("pass --branch or set {}", BRANCH_VAR),
            })?,
    };

    let revision = match revision.or_else(|| from_env(REVISION_VAR)) {
        Some(revision) => revision,
        None => git_output(repo, &["rev-parse", "--short", "HEAD"])
            .await
            .ok_or_else(|| ConfigError::MissingTrigger {
                what: "revision".to_string(),
                hint: format!("pass --revision or set {}", REVISION_VAR),
            })?,
    };

    Ok(TriggerEvent::new(branch.trim(), revision.trim()))
}

async fn git_output(repo: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!(?args, "git query failed");
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}
