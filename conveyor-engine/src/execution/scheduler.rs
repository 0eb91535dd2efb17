// Pipeline Scheduler
// Runs a job graph concurrently, gating dependents on terminal prerequisites

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{GraphError, JobGraph, JobNode};
use crate::execution::job::JobExecutor;
use crate::parser::models::{JobStatus, Pipeline, RunResult, SkipReason};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum jobs running at once (0 = unlimited)
    pub max_parallel_jobs: usize,
    /// Stop starting new jobs once any job fails
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 0,
            fail_fast: true,
        }
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub pipeline_name: String,
    /// One result per job, in declaration order
    pub jobs: Vec<RunResult>,
    pub success: bool,
    pub duration: Duration,
}

impl PipelineResult {
    pub fn job(&self, name: &str) -> Option<&RunResult> {
        self.jobs.iter().find(|j| j.job_name == name)
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &RunResult> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Failed)
    }

    /// Exit code of the first failed job in declaration order
    pub fn exit_code(&self) -> i32 {
        if self.success {
            return 0;
        }
        self.failed_jobs()
            .find_map(|j| j.exit_code)
            .filter(|code| *code != 0)
            .unwrap_or(1)
    }
}

pub struct PipelineScheduler {
    name: String,
    graph: JobGraph,
    executor: Arc<JobExecutor>,
    config: SchedulerConfig,
    event_tx: Option<ProgressSender>,
}

impl PipelineScheduler {
    /// Build the job graph; unknown prerequisites and cycles fail here,
    /// before any job runs
    pub fn from_pipeline(pipeline: &Pipeline, executor: JobExecutor) -> Result<Self, GraphError> {
        let graph = JobGraph::from_pipeline(pipeline)?;
        Ok(Self::new(
            pipeline.name.clone().unwrap_or_else(|| "pipeline".to_string()),
            graph,
            executor,
        ))
    }

    pub fn new(name: impl Into<String>, graph: JobGraph, executor: JobExecutor) -> Self {
        Self {
            name: name.into(),
            graph,
            executor: Arc::new(executor),
            config: SchedulerConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Report run and job events on `tx`
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        let executor = (*self.executor).clone().with_progress(tx.clone());
        self.executor = Arc::new(executor);
        self.event_tx = Some(tx);
        self
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Run every job to a terminal state
    pub async fn run(&self) -> PipelineResult {
        let start = Instant::now();
        let env = self.executor.environment();
        let branch = env.branch().to_string();

        self.event_tx.send_event(ExecutionEvent::pipeline_started(
            &self.name,
            &branch,
            self.graph.len(),
        ));
        info!(pipeline = %self.name, branch = %branch, jobs = self.graph.len(), "run started");
        debug!(env = ?env.redacted(), "environment snapshot");

        let semaphore = match self.config.max_parallel_jobs {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let mut states: HashMap<&str, JobStatus> = self
            .graph
            .nodes()
            .iter()
            .map(|n| (n.name(), JobStatus::Pending))
            .collect();
        let mut results: HashMap<String, RunResult> = HashMap::new();
        let mut running = JoinSet::new();
        let mut aborted = false;

        loop {
            // Settle every pending job that can be decided now
            let mut progressed = true;
            while progressed {
                progressed = false;
                for node in self.graph.nodes() {
                    if states.get(node.name()) != Some(&JobStatus::Pending) {
                        continue;
                    }

                    match self.decide(node, &branch, &results, aborted) {
                        Decision::Wait => {}
                        Decision::Skip(reason) => {
                            debug!(job = node.name(), %reason, "job skipped");
                            self.event_tx
                                .send_event(ExecutionEvent::job_skipped(node.name(), reason.clone()));
                            states.insert(node.name(), JobStatus::Skipped);
                            results.insert(
                                node.name().to_string(),
                                RunResult::skipped(node.name(), reason),
                            );
                            progressed = true;
                        }
                        Decision::Start => {
                            // A job only leaves Pending once it holds a slot, so an
                            // abort still reaches jobs queued behind the limit
                            let permit = match &semaphore {
                                Some(sem) => match sem.clone().try_acquire_owned() {
                                    Ok(permit) => Some(permit),
                                    Err(_) => continue,
                                },
                                None => None,
                            };
                            states.insert(node.name(), JobStatus::Running);
                            self.spawn(&mut running, node, permit);
                        }
                    }
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // spawn() never lets a job task fail; nothing to attribute
                    warn!(error = %e, "job task ended abnormally");
                    continue;
                }
            };

            if result.status == JobStatus::Failed && self.config.fail_fast && !aborted {
                info!(job = %result.job_name, "job failed; no new jobs will start");
                aborted = true;
            }
            if let Some(name) = self.graph.get(&result.job_name).map(JobNode::name) {
                states.insert(name, result.status);
            }
            results.insert(result.job_name.clone(), result);
        }

        let jobs: Vec<RunResult> = self
            .graph
            .nodes()
            .iter()
            .filter_map(|n| results.remove(n.name()))
            .collect();
        let success = jobs.iter().all(|j| j.status != JobStatus::Failed);
        let duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &self.name, success, duration,
        ));
        info!(pipeline = %self.name, success, ?duration, "run finished");

        PipelineResult {
            pipeline_name: self.name.clone(),
            jobs,
            success,
            duration,
        }
    }

    fn decide(
        &self,
        node: &JobNode,
        branch: &str,
        results: &HashMap<String, RunResult>,
        aborted: bool,
    ) -> Decision {
        if !node.job.runs_on_branch(branch) {
            return Decision::Skip(SkipReason::BranchFiltered {
                branch: branch.to_string(),
            });
        }

        let mut waiting = false;
        for dep in &node.dependencies {
            match results.get(dep) {
                None => waiting = true,
                Some(prereq) if !self.satisfies(dep, prereq) => {
                    return Decision::Skip(SkipReason::DependencyUnmet {
                        dependency: dep.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        if aborted {
            Decision::Skip(SkipReason::RunAborted)
        } else if waiting {
            Decision::Wait
        } else {
            Decision::Start
        }
    }

    /// A prerequisite is satisfied by success, or by a branch-filter skip of
    /// a job marked optional
    fn satisfies(&self, name: &str, prereq: &RunResult) -> bool {
        match (&prereq.status, &prereq.skip_reason) {
            (JobStatus::Succeeded, _) => true,
            (JobStatus::Skipped, Some(SkipReason::BranchFiltered { .. })) => self
                .graph
                .get(name)
                .map(|n| n.job.optional)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn spawn(
        &self,
        running: &mut JoinSet<RunResult>,
        node: &JobNode,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let executor = self.executor.clone();
        let job = node.job.clone();

        running.spawn(async move {
            let _permit = permit;

            let name = job.name.clone();
            // Run in an inner task so a panic still yields a result for this job
            let inner = tokio::spawn(async move { executor.run(&job).await });
            match inner.await {
                Ok(result) => result,
                Err(e) => {
                    let mut result = RunResult::skipped(&name, SkipReason::RunAborted);
                    result.status = JobStatus::Failed;
                    result.skip_reason = None;
                    result.exit_code = Some(1);
                    warn!(job = %name, error = %e, "job task panicked");
                    result
                }
            }
        });
    }
}

enum Decision {
    Wait,
    Start,
    Skip(SkipReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::job::tests::executor_for;
    use crate::parser::models::{BranchFilter, Job, Step};

    fn job(name: &str, requires: &[&str], command: &str) -> Job {
        Job {
            name: name.to_string(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            steps: vec![Step::run(name, command)],
            ..Default::default()
        }
    }

    fn pipeline(jobs: Vec<Job>) -> Pipeline {
        Pipeline {
            name: Some("toolkit".to_string()),
            jobs,
            ..Default::default()
        }
    }

    async fn run(
        dir: &std::path::Path,
        branch: &str,
        jobs: Vec<Job>,
        config: SchedulerConfig,
    ) -> PipelineResult {
        PipelineScheduler::from_pipeline(&pipeline(jobs), executor_for(dir, branch, &[]))
            .unwrap()
            .with_config(config)
            .run()
            .await
    }

    fn status_of(result: &PipelineResult, name: &str) -> JobStatus {
        result.job(name).unwrap().status
    }

    #[tokio::test]
    async fn test_fan_out_fan_in_succeeds() {
        let temp = tempfile::tempdir().unwrap();
        let result = run(
            temp.path(),
            "main",
            vec![
                job("build", &[], "echo build > built"),
                job("unit", &["build"], "test -f built"),
                job("lint", &["build"], "test -f built"),
                job("publish", &["unit", "lint"], "true"),
            ],
            SchedulerConfig::default(),
        )
        .await;

        assert!(result.success);
        assert_eq!(result.exit_code(), 0);
        let names: Vec<_> = result.jobs.iter().map(|j| j.job_name.as_str()).collect();
        assert_eq!(names, vec!["build", "unit", "lint", "publish"]);
    }

    #[tokio::test]
    async fn test_independent_jobs_run_concurrently() {
        let temp = tempfile::tempdir().unwrap();
        let wait_for = |me: &str, other: &str| {
            format!(
                "touch {me}.started; i=0; while [ $i -lt 100 ]; do [ -f {other}.started ] && exit 0; sleep 0.05; i=$((i+1)); done; exit 1"
            )
        };

        let result = run(
            temp.path(),
            "main",
            vec![
                job("a", &[], &wait_for("a", "b")),
                job("b", &[], &wait_for("b", "a")),
            ],
            SchedulerConfig::default(),
        )
        .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_dependents_start_after_prerequisites_finish() {
        let temp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let scheduler = PipelineScheduler::from_pipeline(
            &pipeline(vec![
                job("slow", &[], "sleep 0.2"),
                job("fast", &[], "true"),
                job("after", &["slow", "fast"], "true"),
            ]),
            executor_for(temp.path(), "main", &[]),
        )
        .unwrap()
        .with_progress(tx);

        let result = scheduler.run().await;
        drop(scheduler);
        assert!(result.success);

        let mut order = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::JobStarted { job_name, .. } => order.push(format!("start:{job_name}")),
                ExecutionEvent::JobCompleted { job_name, .. } => order.push(format!("done:{job_name}")),
                _ => {}
            }
        }
        let pos = |s: &str| order.iter().position(|e| e == s).unwrap();
        assert!(pos("done:slow") < pos("start:after"));
        assert!(pos("done:fast") < pos("start:after"));
    }

    #[tokio::test]
    async fn test_failed_prerequisite_skips_dependents_transitively() {
        let temp = tempfile::tempdir().unwrap();
        let result = run(
            temp.path(),
            "main",
            vec![
                job("build", &[], "exit 4"),
                job("test", &["build"], "true"),
                job("publish", &["test"], "true"),
            ],
            SchedulerConfig {
                fail_fast: false,
                ..Default::default()
            },
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.exit_code(), 4);
        assert_eq!(status_of(&result, "test"), JobStatus::Skipped);
        assert_eq!(
            result.job("test").unwrap().skip_reason,
            Some(SkipReason::DependencyUnmet {
                dependency: "build".to_string()
            })
        );
        assert_eq!(
            result.job("publish").unwrap().skip_reason,
            Some(SkipReason::DependencyUnmet {
                dependency: "test".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_fail_fast_stops_unrelated_jobs() {
        let temp = tempfile::tempdir().unwrap();
        let jobs = vec![
            job("broken", &[], "exit 1"),
            job("slow", &[], "sleep 0.3"),
            job("later", &["slow"], "true"),
        ];

        let result = run(temp.path(), "main", jobs.clone(), SchedulerConfig::default()).await;
        assert_eq!(status_of(&result, "slow"), JobStatus::Succeeded);
        assert_eq!(
            result.job("later").unwrap().skip_reason,
            Some(SkipReason::RunAborted)
        );

        let relaxed = run(
            temp.path(),
            "main",
            jobs,
            SchedulerConfig {
                fail_fast: false,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(status_of(&relaxed, "later"), JobStatus::Succeeded);
        assert!(!relaxed.success);
    }

    #[tokio::test]
    async fn test_branch_filter_and_optional_prerequisites() {
        let temp = tempfile::tempdir().unwrap();
        let mut master_only = job("master-only", &[], "true");
        master_only.branches = Some(BranchFilter::only(&["master"]));
        let mut optional = job("optional-master", &[], "true");
        optional.branches = Some(BranchFilter::only(&["master"]));
        optional.optional = true;

        let result = run(
            temp.path(),
            "feature-x",
            vec![
                master_only,
                optional,
                job("needs-strict", &["master-only"], "true"),
                job("needs-optional", &["optional-master"], "true"),
            ],
            SchedulerConfig::default(),
        )
        .await;

        assert!(result.success);
        assert_eq!(
            result.job("master-only").unwrap().skip_reason,
            Some(SkipReason::BranchFiltered {
                branch: "feature-x".to_string()
            })
        );
        assert_eq!(status_of(&result, "needs-strict"), JobStatus::Skipped);
        assert_eq!(status_of(&result, "needs-optional"), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_parallel_limit_of_one_serialises() {
        let temp = tempfile::tempdir().unwrap();
        let exclusive = |me: &str| {
            format!("[ -f lock ] && exit 1; touch lock; sleep 0.1; rm lock; echo {me}")
        };

        let result = run(
            temp.path(),
            "main",
            vec![
                job("a", &[], &exclusive("a")),
                job("b", &[], &exclusive("b")),
                job("c", &[], &exclusive("c")),
            ],
            SchedulerConfig {
                max_parallel_jobs: 1,
                fail_fast: false,
            },
        )
        .await;

        assert!(result.success);
    }

    #[tokio::test]
    async fn test_fail_fast_reaches_jobs_queued_behind_limit() {
        let temp = tempfile::tempdir().unwrap();
        let result = run(
            temp.path(),
            "main",
            vec![
                job("broken", &[], "sleep 0.1; exit 1"),
                job("b", &[], "touch b.ran"),
                job("c", &[], "touch c.ran"),
            ],
            SchedulerConfig {
                max_parallel_jobs: 1,
                fail_fast: true,
            },
        )
        .await;

        assert_eq!(status_of(&result, "broken"), JobStatus::Failed);
        for name in ["b", "c"] {
            assert_eq!(
                result.job(name).unwrap().skip_reason,
                Some(SkipReason::RunAborted)
            );
        }
        assert!(!temp.path().join("b.ran").exists());
        assert!(!temp.path().join("c.ran").exists());
    }

    #[test]
    fn test_cycle_rejected_before_running() {
        let temp = tempfile::tempdir().unwrap();
        let err = PipelineScheduler::from_pipeline(
            &pipeline(vec![
                job("a", &["b"], "touch ran"),
                job("b", &["a"], "touch ran"),
            ]),
            executor_for(temp.path(), "main", &[]),
        )
        .err()
        .unwrap();

        assert!(err.message.contains("a -> b -> a"));
        assert!(!temp.path().join("ran").exists());
    }
}
