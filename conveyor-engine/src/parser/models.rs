// Pipeline Data Models
// Types for pipeline definitions, routing tables and run results

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pipeline {
    /// Pipeline name
    pub name: Option<String>,

    /// Pipeline-level environment, visible to every job
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Jobs, in declaration order
    #[serde(default)]
    pub jobs: Vec<Job>,

    /// Branch-keyed deployment routing
    pub deploy: Option<DeployConfig>,
}

impl Pipeline {
    /// Look up a job by name
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// An independently schedulable unit of work
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Job {
    /// Unique job name
    pub name: String,

    /// Container image the steps run in (when container execution is enabled)
    pub image: Option<String>,

    /// Working directory, relative to the run's working directory
    pub working_directory: Option<String>,

    /// Names of jobs that must finish first
    #[serde(default)]
    pub requires: Vec<String>,

    /// Restricts the job to matching source branches
    pub branches: Option<BranchFilter>,

    /// A branch-filtered skip of this job still satisfies its dependents
    #[serde(default)]
    pub optional: bool,

    /// Job-level environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Job {
    /// Whether the job is eligible to run on the given branch
    pub fn runs_on_branch(&self, branch: &str) -> bool {
        self.branches
            .as_ref()
            .map(|filter| filter.matches(branch))
            .unwrap_or(true)
    }
}

/// Glob-based branch predicate
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BranchFilter {
    /// Branch must match one of these (empty = any branch)
    #[serde(default)]
    pub only: Vec<String>,
    /// Branch must match none of these
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl BranchFilter {
    pub fn only(patterns: &[&str]) -> Self {
        Self {
            only: patterns.iter().map(|p| p.to_string()).collect(),
            ignore: Vec::new(),
        }
    }

    pub fn matches(&self, branch: &str) -> bool {
        let included = self.only.is_empty()
            || self
                .only
                .iter()
                .any(|pattern| glob_match::glob_match(pattern, branch));
        let excluded = self
            .ignore
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, branch));

        included && !excluded
    }
}

// =============================================================================
// Steps
// =============================================================================

/// One unit of work within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name used in output and events
    pub name: Option<String>,

    /// What a non-zero exit does to the rest of the job
    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Run even after an aborting failure earlier in the job
    #[serde(default)]
    pub always: bool,

    /// Environment flag that must be truthy for the step to run
    pub gate: Option<String>,

    /// Files copied out after the step, whatever its exit code
    #[serde(default)]
    pub artifacts: Vec<String>,

    /// Step-level environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Step timeout
    pub timeout_in_minutes: Option<u32>,

    /// The action to perform (flattened from different step types)
    #[serde(flatten)]
    pub action: StepAction,
}

impl Step {
    /// Create a shell step with default policy
    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            on_failure: FailurePolicy::Abort,
            always: false,
            gate: None,
            artifacts: Vec::new(),
            env: HashMap::new(),
            timeout_in_minutes: None,
            action: StepAction::Run(RunStep {
                run: command.into(),
            }),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_gate(mut self, flag: impl Into<String>) -> Self {
        self.gate = Some(flag.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: &[&str]) -> Self {
        self.artifacts = artifacts.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn always(mut self) -> Self {
        self.always = true;
        self
    }

    /// Name for display, falling back to the action kind
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.action.kind().to_string())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_in_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }

    /// Whether this step executes once the job has been aborted
    pub fn runs_after_abort(&self) -> bool {
        self.always || self.on_failure == FailurePolicy::Continue
    }
}

/// Failure policy for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A non-zero exit stops the remaining ordinary steps
    #[default]
    #[serde(alias = "abort-job")]
    Abort,
    /// A non-zero exit is recorded and re-raised once the job finishes
    #[serde(alias = "continue-and-record")]
    Continue,
}

/// The specific action a step performs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepAction {
    /// - run: make test
    Run(RunStep),
    /// - restore_cache: { key: image-{{branch}}, path: image.tar }
    RestoreCache(RestoreCacheStep),
    /// - save_cache: { key: image-{{branch}}, path: image.tar }
    SaveCache(SaveCacheStep),
    /// - store_artifacts: { path: test-output }
    StoreArtifacts(StoreArtifactsStep),
    /// - publish: { image: toolkit, tag: "{{revision}}", credentials: [...] }
    Publish(PublishStep),
    /// - deploy: {}
    Deploy(DeployStep),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Run(_) => "run",
            StepAction::RestoreCache(_) => "restore_cache",
            StepAction::SaveCache(_) => "save_cache",
            StepAction::StoreArtifacts(_) => "store_artifacts",
            StepAction::Publish(_) => "publish",
            StepAction::Deploy(_) => "deploy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub run: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreCacheStep {
    pub restore_cache: CacheSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveCacheStep {
    pub save_cache: CacheSpec,
}

/// Cache key template and the file holding the blob
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSpec {
    pub key: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreArtifactsStep {
    pub store_artifacts: ArtifactSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishStep {
    pub publish: PublishSpec,
}

/// Image push to the external registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishSpec {
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Environment variables holding the username and password, in that order
    #[serde(default)]
    pub credentials: Vec<String>,
}

fn default_tag() -> String {
    "{{revision}}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStep {
    pub deploy: DeploySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeploySpec {
    /// Identifier substituted into the manifest (default: the revision)
    #[serde(default)]
    pub artifact: Option<String>,
}

// =============================================================================
// Deployment routing
// =============================================================================

/// Deployment table: manifest template plus branch routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Manifest template path, relative to the working directory
    pub template: String,

    /// Token replaced by the artifact identifier
    #[serde(default = "default_placeholder")]
    pub placeholder: String,

    /// Exact-match branch routes
    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    /// Route for branches not in the table
    #[serde(default)]
    pub default: DefaultRoute,
}

fn default_placeholder() -> String {
    "IMAGE_TAG".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSpec {
    pub branch: String,
    #[serde(default)]
    pub action: RouteAction,
    pub environment: Option<String>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub production: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    #[default]
    Apply,
    Noop,
}

/// Fallback route; never production
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultRoute {
    pub environment: String,
    pub namespace: String,
}

impl Default for DefaultRoute {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            namespace: "default".to_string(),
        }
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// Source-control event that triggered the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub branch: String,
    pub revision: String,
}

impl TriggerEvent {
    pub fn new(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            revision: revision.into(),
        }
    }
}

// =============================================================================
// Execution Results (for runtime)
// =============================================================================

#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    /// Human-readable note (gate closed, cache miss, missing credentials)
    pub notice: Option<String>,
    pub artifacts: Vec<PathBuf>,
    pub duration: Duration,
}

impl StepResult {
    pub fn skipped(step_name: impl Into<String>, notice: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            output: String::new(),
            error: None,
            notice: Some(notice.into()),
            artifacts: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(step_name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Succeeded,
            exit_code: Some(0),
            output: output.into(),
            error: None,
            notice: None,
            artifacts: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(step_name: impl Into<String>, exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Failed,
            exit_code: Some(exit_code),
            output: String::new(),
            error: Some(error.into()),
            notice: None,
            artifacts: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn with_notice(mut self, notice: impl Into<String>) -> Self {
        self.notice = Some(notice.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Job lifecycle state; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Why a job never ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The job's branch filter excluded the current branch
    BranchFiltered { branch: String },
    /// A prerequisite failed, was skipped, or was filtered without being optional
    DependencyUnmet { dependency: String },
    /// Another job failed and the run stopped starting new jobs
    RunAborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BranchFiltered { branch } => {
                write!(f, "branch '{}' excluded by filter", branch)
            }
            SkipReason::DependencyUnmet { dependency } => {
                write!(f, "prerequisite '{}' did not succeed", dependency)
            }
            SkipReason::RunAborted => f.write_str("run aborted after an earlier failure"),
        }
    }
}

/// Terminal outcome of one job
#[derive(Debug, Clone)]
pub struct RunResult {
    pub job_name: String,
    pub status: JobStatus,
    pub skip_reason: Option<SkipReason>,
    /// Exit code of the first failing step, 0 on success, None when skipped
    pub exit_code: Option<i32>,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<PathBuf>,
    pub duration: Duration,
}

impl RunResult {
    pub fn skipped(job_name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            job_name: job_name.into(),
            status: JobStatus::Skipped,
            skip_reason: Some(reason),
            exit_code: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_filter_only_and_ignore() {
        let filter = BranchFilter {
            only: vec!["release/*".to_string(), "master".to_string()],
            ignore: vec!["release/old-*".to_string()],
        };

        assert!(filter.matches("master"));
        assert!(filter.matches("release/1.2"));
        assert!(!filter.matches("release/old-1"));
        assert!(!filter.matches("feature-x"));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = BranchFilter::default();
        assert!(filter.matches("anything"));

        let job = Job {
            name: "build".to_string(),
            ..Default::default()
        };
        assert!(job.runs_on_branch("feature-x"));
    }

    #[test]
    fn test_step_action_deserialization() {
        let yaml = r#"
- run: make test
  on_failure: continue
  artifacts: [out]
- restore_cache: { key: "image-{{branch}}", path: image.tar }
- publish: { image: toolkit, credentials: [USER, PASS] }
- deploy: {}
- name: smoke
  run: ./smoke.sh
  gate: RUN_SMOKETEST
"#;
        let steps: Vec<Step> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(steps.len(), 5);
        assert!(matches!(steps[0].action, StepAction::Run(_)));
        assert_eq!(steps[0].on_failure, FailurePolicy::Continue);
        assert_eq!(steps[0].artifacts, vec!["out".to_string()]);
        assert!(matches!(steps[1].action, StepAction::RestoreCache(_)));
        match &steps[2].action {
            StepAction::Publish(p) => {
                assert_eq!(p.publish.tag, "{{revision}}");
                assert_eq!(p.publish.credentials.len(), 2);
            }
            other => panic!("expected publish, got {:?}", other),
        }
        assert!(matches!(steps[3].action, StepAction::Deploy(_)));
        assert_eq!(steps[4].gate.as_deref(), Some("RUN_SMOKETEST"));
        assert_eq!(steps[4].label(), "smoke");
    }

    #[test]
    fn test_failure_policy_aliases() {
        let policy: FailurePolicy = serde_yaml::from_str("abort-job").unwrap();
        assert_eq!(policy, FailurePolicy::Abort);
        let policy: FailurePolicy = serde_yaml::from_str("continue-and-record").unwrap();
        assert_eq!(policy, FailurePolicy::Continue);
    }

    #[test]
    fn test_runs_after_abort() {
        assert!(!Step::run("a", "true").runs_after_abort());
        assert!(Step::run("b", "true").always().runs_after_abort());
        assert!(Step::run("c", "true")
            .with_policy(FailurePolicy::Continue)
            .runs_after_abort());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
    }
}
