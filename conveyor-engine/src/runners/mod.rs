// Runners Module
// Command execution for run steps, on the host or inside a job image

pub mod container;
pub mod shell;

pub use container::{ContainerConfig, ContainerError, ContainerRunner, ImagePullPolicy};
pub use shell::{OutputCallback, ShellOutput, ShellRunner, SPAWN_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// A fully expanded command ready to execute
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    /// Image to run in; ignored by the shell runner
    pub image: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
            working_dir: working_dir.into(),
            image: None,
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Executes one command and reports how it ended. Never panics on a failing
/// command; spawn errors and timeouts come back as non-zero exit codes.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest, on_output: Option<OutputCallback>) -> ShellOutput;
}

/// Runs on the host unless a container runner is enabled and the job names
/// an image
pub struct RunnerRegistry {
    shell: ShellRunner,
    container: Option<ContainerRunner>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            shell: ShellRunner::new(),
            container: None,
        }
    }

    pub fn with_container_runner(mut self, runner: ContainerRunner) -> Self {
        self.container = Some(runner);
        self
    }

}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for RunnerRegistry {
    async fn run(&self, request: &CommandRequest, on_output: Option<OutputCallback>) -> ShellOutput {
        match (&self.container, &request.image) {
            (Some(container), Some(_)) => container.run(request, on_output).await,
            _ => self.shell.run(request, on_output).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_without_containers_ignores_image() {
        let temp = tempfile::tempdir().unwrap();
        let registry = RunnerRegistry::new();
        let request = CommandRequest::new("echo on-host", temp.path())
            .with_image(Some("alpine:3".to_string()));

        let output = registry.run(&request, None).await;
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "on-host");
    }
}
