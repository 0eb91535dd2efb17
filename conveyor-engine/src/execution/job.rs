// Job Executor
// Runs one job's steps in order under per-step failure policies

use crate::artifacts::ArtifactStore;
use crate::cache::{ArtifactCache, RestoreOutcome, SaveOutcome};
use crate::deploy::{DeployOutcome, Deployer};
use crate::execution::context::{substitute, EnvironmentSnapshot};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::gate::{ConditionalGate, GateDecision};
use crate::parser::models::{
    FailurePolicy, Job, JobStatus, PublishSpec, RunResult, Step, StepAction, StepResult,
    StepStatus,
};
use crate::registry::{image_reference, ImageRegistry, RegistryCredentials};
use crate::runners::{CommandRequest, CommandRunner, OutputCallback};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Exit code for failures that are not a process exit (push, apply)
const COLLABORATOR_FAILURE_EXIT_CODE: i32 = 1;

/// The first failure of a job, held until its last step has run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFailure {
    pub step_index: usize,
    pub step_name: String,
    pub exit_code: i32,
}

/// Progress through a job's steps
#[derive(Debug, Default)]
struct StepLedger {
    pending: Option<PendingFailure>,
    aborted: bool,
}

impl StepLedger {
    /// Record a failed step. Only the first failure is kept.
    fn record_failure(&mut self, step_index: usize, step: &Step, exit_code: i32) {
        if self.pending.is_none() {
            self.pending = Some(PendingFailure {
                step_index,
                step_name: step.label(),
                exit_code,
            });
        }
        if step.on_failure == FailurePolicy::Abort {
            self.aborted = true;
        }
    }

    fn skips(&self, step: &Step) -> bool {
        self.aborted && !step.runs_after_abort()
    }
}

/// Everything a step can reach besides the process it runs
#[derive(Clone)]
pub struct JobExecutor {
    env: Arc<EnvironmentSnapshot>,
    pipeline_env: HashMap<String, String>,
    working_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    cache: ArtifactCache,
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<dyn ImageRegistry>,
    deployer: Option<Deployer>,
    event_tx: Option<ProgressSender>,
}

impl JobExecutor {
    pub fn new(
        env: Arc<EnvironmentSnapshot>,
        working_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        cache: ArtifactCache,
        artifacts: Arc<dyn ArtifactStore>,
        registry: Arc<dyn ImageRegistry>,
    ) -> Self {
        Self {
            env,
            pipeline_env: HashMap::new(),
            working_dir: working_dir.into(),
            runner,
            cache,
            artifacts,
            registry,
            deployer: None,
            event_tx: None,
        }
    }

    pub fn with_pipeline_env(mut self, env: HashMap<String, String>) -> Self {
        self.pipeline_env = env;
        self
    }

    pub fn with_deployer(mut self, deployer: Deployer) -> Self {
        self.deployer = Some(deployer);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn environment(&self) -> &EnvironmentSnapshot {
        &self.env
    }

    /// Run every step of `job`. Never panics on step failure; the outcome is
    /// in the returned result.
    pub async fn run(&self, job: &Job) -> RunResult {
        let start = Instant::now();
        self.event_tx
            .send_event(ExecutionEvent::job_started(&job.name, job.steps.len()));
        info!(job = %job.name, steps = job.steps.len(), "job started");

        let job_env = self.env.layered(&[&self.pipeline_env, &job.env]);
        let work_dir = match &job.working_directory {
            Some(dir) => self.working_dir.join(self.expand(dir, &job_env)),
            None => self.working_dir.clone(),
        };

        let gate = ConditionalGate::new(&self.env);
        let mut ledger = StepLedger::default();
        let mut steps = Vec::with_capacity(job.steps.len());
        let mut artifacts = Vec::new();

        for (index, step) in job.steps.iter().enumerate() {
            let label = step.label();

            if ledger.skips(step) {
                let reason = match &ledger.pending {
                    Some(failure) => format!("job aborted after '{}' failed", failure.step_name),
                    None => "job aborted".to_string(),
                };
                self.event_tx.send_event(ExecutionEvent::step_skipped(
                    &job.name, &label, index, &reason,
                ));
                steps.push(StepResult::skipped(label, reason));
                continue;
            }

            if let Some(flag) = &step.gate {
                if let GateDecision::Closed(notice) = gate.evaluate(flag) {
                    self.event_tx.send_event(ExecutionEvent::step_skipped(
                        &job.name, &label, index, &notice,
                    ));
                    steps.push(StepResult::skipped(label, notice));
                    continue;
                }
            }

            self.event_tx
                .send_event(ExecutionEvent::step_started(&job.name, &label, index));
            let step_start = Instant::now();

            let step_env = self.step_env(&job_env, step);
            let mut result = self
                .execute_action(job, step, index, &step_env, &work_dir)
                .await;

            // Declared artifacts are collected whatever the exit code
            for declared in &step.artifacts {
                let path = work_dir.join(self.expand(declared, &step_env));
                if let Some(stored) = self.store_artifact(&job.name, &path).await {
                    result.artifacts.push(stored);
                }
            }
            result.duration = step_start.elapsed();

            self.event_tx.send_event(ExecutionEvent::step_completed(
                &job.name,
                &label,
                index,
                result.status,
                result.duration,
                result.exit_code,
            ));

            if result.status == StepStatus::Failed {
                let exit_code = result.exit_code.unwrap_or(COLLABORATOR_FAILURE_EXIT_CODE);
                warn!(job = %job.name, step = %label, exit_code, policy = ?step.on_failure, "step failed");
                ledger.record_failure(index, step, exit_code);
            }

            artifacts.extend(result.artifacts.iter().cloned());
            steps.push(result);
        }

        let (status, exit_code) = match &ledger.pending {
            Some(failure) => (JobStatus::Failed, Some(failure.exit_code)),
            None => (JobStatus::Succeeded, Some(0)),
        };
        let duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::job_completed(
            &job.name, status, exit_code, duration,
        ));
        info!(job = %job.name, %status, ?duration, "job finished");

        RunResult {
            job_name: job.name.clone(),
            status,
            skip_reason: None,
            exit_code,
            steps,
            artifacts,
            duration,
        }
    }

    fn expand(&self, template: &str, env: &HashMap<String, String>) -> String {
        substitute(template, env, self.env.branch(), self.env.revision())
    }

    fn step_env(&self, job_env: &HashMap<String, String>, step: &Step) -> HashMap<String, String> {
        let mut env = job_env.clone();
        for (key, value) in &step.env {
            let value = self.expand(value, &env);
            env.insert(key.clone(), value);
        }
        env
    }

    async fn store_artifact(&self, job_name: &str, path: &Path) -> Option<PathBuf> {
        match self.artifacts.store(job_name, path).await {
            Ok(Some(stored)) => {
                self.event_tx.send_event(ExecutionEvent::ArtifactStored {
                    job_name: job_name.to_string(),
                    path: stored.clone(),
                });
                Some(stored)
            }
            Ok(None) => {
                debug!(job = job_name, path = %path.display(), "artifact not present");
                None
            }
            Err(e) => {
                warn!(job = job_name, path = %path.display(), error = %e, "artifact copy failed");
                self.event_tx.send_event(ExecutionEvent::warning(
                    format!("could not store artifact {}: {}", path.display(), e),
                    Some(job_name.to_string()),
                ));
                None
            }
        }
    }

    async fn execute_action(
        &self,
        job: &Job,
        step: &Step,
        index: usize,
        env: &HashMap<String, String>,
        work_dir: &Path,
    ) -> StepResult {
        let label = step.label();
        match &step.action {
            StepAction::Run(run) => {
                let request = CommandRequest::new(self.expand(&run.run, env), work_dir)
                    .with_env(env.clone())
                    .with_image(job.image.as_ref().map(|i| self.expand(i, env)))
                    .with_timeout(step.timeout());
                self.run_command(&job.name, &label, index, &request).await
            }

            StepAction::RestoreCache(restore) => {
                let key = self.expand(&restore.restore_cache.key, env);
                let dest = work_dir.join(self.expand(&restore.restore_cache.path, env));
                let outcome = self.cache.restore_into(&key, &dest).await;

                match &outcome {
                    RestoreOutcome::Hit { discriminator, .. } => {
                        self.event_tx.send_event(ExecutionEvent::CacheRestored {
                            job_name: job.name.clone(),
                            key: key.clone(),
                            discriminator: discriminator.to_string(),
                        })
                    }
                    RestoreOutcome::Miss | RestoreOutcome::Unavailable(_) => {
                        self.event_tx.send_event(ExecutionEvent::CacheMiss {
                            job_name: job.name.clone(),
                            key: key.clone(),
                        })
                    }
                }
                StepResult::succeeded(label, "").with_notice(outcome.notice(&key))
            }

            StepAction::SaveCache(save) => {
                let key = self.expand(&save.save_cache.key, env);
                let src = work_dir.join(self.expand(&save.save_cache.path, env));
                let outcome = self.cache.save_from(&key, &src).await;

                match &outcome {
                    SaveOutcome::Saved { discriminator, .. } => {
                        self.event_tx.send_event(ExecutionEvent::CacheSaved {
                            job_name: job.name.clone(),
                            key: key.clone(),
                            discriminator: discriminator.to_string(),
                        })
                    }
                    SaveOutcome::Failed(_) => self.event_tx.send_event(ExecutionEvent::warning(
                        outcome.notice(&key),
                        Some(job.name.clone()),
                    )),
                }
                StepResult::succeeded(label, "").with_notice(outcome.notice(&key))
            }

            StepAction::StoreArtifacts(store) => {
                let path = work_dir.join(self.expand(&store.store_artifacts.path, env));
                let mut result = StepResult::succeeded(label, "");
                match self.store_artifact(&job.name, &path).await {
                    Some(stored) => result.artifacts.push(stored),
                    None => {
                        result.notice = Some(format!("nothing stored from {}", path.display()))
                    }
                }
                result
            }

            StepAction::Publish(publish) => self.publish(&job.name, label, &publish.publish, env).await,

            StepAction::Deploy(deploy) => {
                let artifact = deploy
                    .deploy
                    .artifact
                    .as_ref()
                    .map(|a| self.expand(a, env))
                    .unwrap_or_else(|| self.env.revision().to_string());
                self.deploy(&job.name, label, &artifact).await
            }
        }
    }

    async fn run_command(
        &self,
        job_name: &str,
        label: &str,
        index: usize,
        request: &CommandRequest,
    ) -> StepResult {
        let on_output: Option<OutputCallback> = self.event_tx.clone().map(|tx| {
            let job_name = job_name.to_string();
            let callback: OutputCallback = Arc::new(move |line: &str, is_stderr: bool| {
                tx.send_event(ExecutionEvent::step_output(&job_name, index, line, is_stderr));
            });
            callback
        });

        let output = self.runner.run(request, on_output).await;
        let exit_code = output.exit_code.unwrap_or(COLLABORATOR_FAILURE_EXIT_CODE);

        if output.success() {
            let mut result = StepResult::succeeded(label, output.stdout);
            if !output.stderr.is_empty() {
                result.error = Some(output.stderr);
            }
            result
        } else {
            let mut result = StepResult::failed(label, exit_code, output.stderr);
            result.output = output.stdout;
            result
        }
    }

    async fn publish(
        &self,
        job_name: &str,
        label: String,
        spec: &PublishSpec,
        env: &HashMap<String, String>,
    ) -> StepResult {
        let image = self.expand(&spec.image, env);
        let tag = self.expand(&spec.tag, env);

        let credentials = match spec.credentials.as_slice() {
            [] => None,
            [user_var, pass_var] => {
                let lookup = |name: &str| env.get(name).filter(|v| !v.is_empty()).cloned();
                match (lookup(user_var.as_str()), lookup(pass_var.as_str())) {
                    (Some(user), Some(pass)) => Some(RegistryCredentials::new(user, pass)),
                    (user, _) => {
                        let missing = if user.is_none() { user_var } else { pass_var };
                        let notice = format!(
                            "{} is not set; skipping publish of {}",
                            missing,
                            image_reference(&image, &tag)
                        );
                        warn!(job = job_name, missing = %missing, "publish skipped");
                        self.event_tx.send_event(ExecutionEvent::warning(
                            notice.clone(),
                            Some(job_name.to_string()),
                        ));
                        return StepResult::skipped(label, notice);
                    }
                }
            }
            other => {
                return StepResult::failed(
                    label,
                    COLLABORATOR_FAILURE_EXIT_CODE,
                    format!(
                        "publish expects a username and password variable, got {}",
                        other.len()
                    ),
                )
            }
        };

        match self.registry.push(&image, &tag, credentials.as_ref()).await {
            Ok(()) => StepResult::succeeded(label, format!("pushed {}", image_reference(&image, &tag))),
            Err(e) => StepResult::failed(label, COLLABORATOR_FAILURE_EXIT_CODE, e.to_string()),
        }
    }

    async fn deploy(&self, job_name: &str, label: String, artifact: &str) -> StepResult {
        let branch = self.env.branch().to_string();
        let Some(deployer) = &self.deployer else {
            return StepResult::failed(
                label,
                COLLABORATOR_FAILURE_EXIT_CODE,
                crate::deploy::DeployError::NotConfigured.to_string(),
            );
        };

        let outcome = deployer.deploy(&branch, artifact).await;
        let (namespace, success) = match &outcome {
            Ok(done) => (done.target().namespace().map(String::from), true),
            Err(_) => (deployer.router().route(&branch).namespace().map(String::from), false),
        };
        self.event_tx.send_event(ExecutionEvent::Deployment {
            job_name: job_name.to_string(),
            branch: branch.clone(),
            namespace,
            success,
        });

        match outcome {
            Ok(DeployOutcome::Skipped { target }) => StepResult::succeeded(label, "")
                .with_notice(format!("{}; nothing to deploy", target)),
            Ok(DeployOutcome::Applied {
                target,
                manifest,
                output,
            }) => StepResult::succeeded(label, output).with_notice(format!(
                "deployed {} as {} ({})",
                artifact,
                target,
                manifest.display()
            )),
            Err(e) => StepResult::failed(label, COLLABORATOR_FAILURE_EXIT_CODE, e.to_string()),
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("working_dir", &self.working_dir)
            .field("deployer", &self.deployer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::artifacts::FsArtifactStore;
    use crate::cache::MemoryCacheStore;
    use crate::deploy::tests::{deploy_config, write_template, RecordingCluster};
    use crate::parser::models::{
        CacheSpec, DeploySpec, DeployStep, PublishStep, RestoreCacheStep, SaveCacheStep,
        TriggerEvent,
    };
    use crate::registry::RegistryError;
    use crate::runners::ShellRunner;

    use std::sync::Mutex;

    /// Records pushes instead of talking to docker
    #[derive(Default)]
    pub(crate) struct RecordingRegistry {
        pub pushes: Mutex<Vec<(String, String, Option<RegistryCredentials>)>>,
    }

    #[async_trait::async_trait]
    impl ImageRegistry for RecordingRegistry {
        async fn push(
            &self,
            image: &str,
            tag: &str,
            credentials: Option<&RegistryCredentials>,
        ) -> Result<(), RegistryError> {
            self.pushes.lock().unwrap().push((
                image.to_string(),
                tag.to_string(),
                credentials.cloned(),
            ));
            Ok(())
        }
    }

    pub(crate) fn executor_for(
        work_dir: &Path,
        branch: &str,
        vars: &[(&str, &str)],
    ) -> JobExecutor {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let env = EnvironmentSnapshot::from_vars(vars, TriggerEvent::new(branch, "abc123"));
        JobExecutor::new(
            Arc::new(env),
            work_dir,
            Arc::new(ShellRunner::new()),
            ArtifactCache::new(Arc::new(MemoryCacheStore::new())),
            Arc::new(FsArtifactStore::new(work_dir.join(".artifacts"), "run-1")),
            Arc::new(RecordingRegistry::default()),
        )
    }

    fn job(steps: Vec<Step>) -> Job {
        Job {
            name: "test".to_string(),
            steps,
            ..Default::default()
        }
    }

    fn statuses(result: &RunResult) -> Vec<StepStatus> {
        result.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "main", &[]);

        let result = executor
            .run(&job(vec![Step::run("a", "echo one"), Step::run("b", "echo two")]))
            .await;

        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.steps[1].output, "two");
    }

    #[tokio::test]
    async fn test_abort_skips_ordinary_but_runs_continue_and_always() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "main", &[]);

        let result = executor
            .run(&job(vec![
                Step::run("fails", "exit 3"),
                Step::run("ordinary", "echo never"),
                Step::run("recorded", "echo still").with_policy(FailurePolicy::Continue),
                Step::run("cleanup", "echo cleanup").always(),
            ]))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(
            statuses(&result),
            vec![
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Succeeded,
                StepStatus::Succeeded
            ]
        );
        assert!(result.steps[1]
            .notice
            .as_deref()
            .unwrap()
            .contains("'fails' failed"));
    }

    #[tokio::test]
    async fn test_continue_failure_surfaces_at_end_with_first_exit_code() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "main", &[]);

        let result = executor
            .run(&job(vec![
                Step::run("tests", "exit 2").with_policy(FailurePolicy::Continue),
                Step::run("report", "echo report"),
                Step::run("later", "exit 5"),
            ]))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(
            statuses(&result),
            vec![StepStatus::Failed, StepStatus::Succeeded, StepStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_artifacts_copied_from_failing_step() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "main", &[]);

        let result = executor
            .run(&job(vec![Step::run(
                "tests",
                "mkdir -p test-output && echo fail > test-output/report.txt && exit 1",
            )
            .with_policy(FailurePolicy::Continue)
            .with_artifacts(&["test-output", "coverage.xml"])]))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.artifacts.len(), 1);
        assert!(result.artifacts[0].join("report.txt").exists());
    }

    #[tokio::test]
    async fn test_gate_unset_skips_without_failure() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "main", &[]);

        let result = executor
            .run(&job(vec![
                Step::run("build", "echo build"),
                Step::run("smoke", "exit 9").with_gate("RUN_SMOKETEST"),
            ]))
            .await;

        assert!(result.succeeded());
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert!(result.steps[1]
            .notice
            .as_deref()
            .unwrap()
            .contains("RUN_SMOKETEST is not set"));
    }

    #[tokio::test]
    async fn test_gate_open_runs_normally() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "main", &[("RUN_SMOKETEST", "true")]);

        let result = executor
            .run(&job(vec![Step::run("smoke", "exit 9").with_gate("RUN_SMOKETEST")]))
            .await;

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(9));
    }

    #[tokio::test]
    async fn test_variables_and_trigger_reach_commands() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "feature/x", &[("IMAGE", "toolkit")]);

        let mut step = Step::run("tag", "echo ${IMAGE}:{{revision}} $CONVEYOR_BRANCH $STEP_VAR");
        step.env.insert("STEP_VAR".to_string(), "${IMAGE}-step".to_string());

        let result = executor.run(&job(vec![step])).await;
        assert_eq!(result.steps[0].output, "toolkit:abc123 feature/x toolkit-step");
    }

    fn cache_step(restore: bool) -> Step {
        let spec = CacheSpec {
            key: "image-{{branch}}".to_string(),
            path: "image.tar".to_string(),
        };
        let mut step = Step::run("cache", "true");
        step.name = None;
        step.action = if restore {
            StepAction::RestoreCache(RestoreCacheStep { restore_cache: spec })
        } else {
            StepAction::SaveCache(SaveCacheStep { save_cache: spec })
        };
        step
    }

    #[tokio::test]
    async fn test_cold_then_warm_cache() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "master", &[]);
        let build = job(vec![
            cache_step(true),
            Step::run("build", "[ -f image.tar ] && echo warm || (echo cold; echo layers > image.tar)"),
            cache_step(false),
        ]);

        let first = executor.run(&build).await;
        assert!(first.succeeded());
        assert!(first.steps[0].notice.as_deref().unwrap().contains("building cold"));
        assert_eq!(first.steps[1].output, "cold");

        std::fs::remove_file(temp.path().join("image.tar")).unwrap();
        let second = executor.run(&build).await;
        assert!(second.steps[0].notice.as_deref().unwrap().starts_with("restored image-master"));
        assert_eq!(second.steps[1].output, "warm");
    }

    #[tokio::test]
    async fn test_save_cache_without_file_is_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor_for(temp.path(), "master", &[]);

        let result = executor.run(&job(vec![cache_step(false)])).await;
        assert!(result.succeeded());
        assert!(result.steps[0].notice.as_deref().unwrap().contains("skipped"));
    }

    fn publish_step(credentials: &[&str]) -> Step {
        let mut step = Step::run("publish", "true");
        step.action = StepAction::Publish(PublishStep {
            publish: PublishSpec {
                image: "acme/toolkit".to_string(),
                tag: "{{revision}}".to_string(),
                credentials: credentials.iter().map(|c| c.to_string()).collect(),
            },
        });
        step
    }

    #[tokio::test]
    async fn test_publish_without_credentials_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::default());
        let mut executor = executor_for(temp.path(), "master", &[("DOCKER_USER", "bot")]);
        executor.registry = registry.clone();

        let result = executor
            .run(&job(vec![publish_step(&["DOCKER_USER", "DOCKER_PASS"])]))
            .await;

        assert!(result.succeeded());
        assert_eq!(result.steps[0].status, StepStatus::Skipped);
        assert!(result.steps[0].notice.as_deref().unwrap().contains("DOCKER_PASS is not set"));
        assert!(registry.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_with_credentials_pushes() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Arc::new(RecordingRegistry::default());
        let mut executor = executor_for(
            temp.path(),
            "master",
            &[("DOCKER_USER", "bot"), ("DOCKER_PASS", "hunter2")],
        );
        executor.registry = registry.clone();

        let result = executor
            .run(&job(vec![publish_step(&["DOCKER_USER", "DOCKER_PASS"])]))
            .await;

        assert!(result.succeeded());
        let pushes = registry.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "acme/toolkit");
        assert_eq!(pushes[0].1, "abc123");
        assert_eq!(
            pushes[0].2,
            Some(RegistryCredentials::new("bot", "hunter2"))
        );
    }

    fn deploy_step() -> Step {
        let mut step = Step::run("deploy", "true");
        step.action = StepAction::Deploy(DeployStep {
            deploy: DeploySpec::default(),
        });
        step
    }

    #[tokio::test]
    async fn test_deploy_feature_branch_applies_revision() {
        let temp = tempfile::tempdir().unwrap();
        write_template(temp.path());
        let cluster = Arc::new(RecordingCluster::default());
        let executor = executor_for(temp.path(), "feature-x", &[]).with_deployer(Deployer::new(
            &deploy_config(),
            temp.path(),
            cluster.clone(),
        ));

        let result = executor.run(&job(vec![deploy_step()])).await;

        assert!(result.succeeded());
        let calls = cluster.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, "image: acme/toolkit:abc123\n");
    }

    #[tokio::test]
    async fn test_deploy_apply_failure_fails_step() {
        let temp = tempfile::tempdir().unwrap();
        write_template(temp.path());
        let cluster = Arc::new(RecordingCluster {
            fail: true,
            ..Default::default()
        });
        let executor = executor_for(temp.path(), "feature-x", &[]).with_deployer(Deployer::new(
            &deploy_config(),
            temp.path(),
            cluster,
        ));

        let result = executor.run(&job(vec![deploy_step()])).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.steps[0].error.as_deref().unwrap().contains("forbidden"));
    }

    #[tokio::test]
    async fn test_events_stream_step_output() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let executor = executor_for(temp.path(), "main", &[]).with_progress(tx);

        executor.run(&job(vec![Step::run("hello", "echo hi")])).await;
        drop(executor);

        let mut saw_output = false;
        let mut saw_completed = false;
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::StepOutput { output, .. } if output == "hi" => saw_output = true,
                ExecutionEvent::JobCompleted { status, .. } => {
                    saw_completed = status == JobStatus::Succeeded
                }
                _ => {}
            }
        }
        assert!(saw_output && saw_completed);
    }
}
