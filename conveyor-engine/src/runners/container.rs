// Container Runner
// Executes run steps inside a job's image with the docker CLI

use super::shell::run_process;
use super::{CommandRequest, CommandRunner, OutputCallback, ShellOutput};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Host variables that describe the host and must not leak into the image
const HOST_ONLY_VARS: [&str; 9] = [
    "PATH", "HOME", "HOSTNAME", "PWD", "OLDPWD", "SHELL", "SHLVL", "TMPDIR", "USER",
];

const WORKSPACE: &str = "/workspace";

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Docker is not available: {0}")]
    DockerNotAvailable(String),

    #[error("Failed to pull image: {0}")]
    PullFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub pull_policy: ImagePullPolicy,
    /// Extra `docker run` flags, e.g. `--network host`
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    /// Must already be present locally
    Never,
}

impl FromStr for ImagePullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "if-not-present" => Ok(Self::IfNotPresent),
            "never" => Ok(Self::Never),
            other => Err(format!(
                "unknown pull policy '{}' (expected always, if-not-present or never)",
                other
            )),
        }
    }
}

/// Unique per process so a timed-out container can be found and killed
fn container_name() -> String {
    let seq = CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("conveyor-{}-{}", std::process::id(), seq)
}

/// Runs each command in a fresh `docker run --rm` with the working directory
/// mounted at `/workspace`
#[derive(Debug, Clone, Default)]
pub struct ContainerRunner {
    config: ContainerConfig,
}

impl ContainerRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Check if the docker daemon answers
    pub async fn is_available(&self) -> bool {
        let output = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await;

        output.map(|o| o.status.success()).unwrap_or(false)
    }

    /// Pull an image if needed based on pull policy
    pub async fn prepare_image(&self, image: &str) -> Result<(), ContainerError> {
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                let output = Command::new("docker")
                    .args(["image", "inspect", image])
                    .output()
                    .await
                    .map_err(|e| ContainerError::DockerNotAvailable(e.to_string()))?;

                if output.status.success() {
                    Ok(())
                } else {
                    self.pull_image(image).await
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        info!(image, "pulling image");
        let output = Command::new("docker")
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| ContainerError::DockerNotAvailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::PullFailed(format!(
                "Failed to pull {}: {}",
                image,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Arguments for `docker`. Values are passed as `-e NAME` so they come
    /// from the docker client's environment and never appear in argv.
    pub fn docker_args(&self, name: &str, image: &str, request: &CommandRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{}", request.working_dir.display(), WORKSPACE),
            "-w".to_string(),
            WORKSPACE.to_string(),
        ];

        let mut names: Vec<_> = forwarded_env(&request.env).into_keys().collect();
        names.sort();
        for name in names {
            args.push("-e".to_string());
            args.push(name);
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push(image.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(request.command.clone());
        args
    }
}

fn forwarded_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(name, _)| !HOST_ONLY_VARS.contains(&name.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[async_trait::async_trait]
impl CommandRunner for ContainerRunner {
    async fn run(&self, request: &CommandRequest, on_output: Option<OutputCallback>) -> ShellOutput {
        let Some(image) = request.image.as_deref() else {
            return super::ShellRunner::new().run(request, on_output).await;
        };

        if let Err(e) = self.prepare_image(image).await {
            return ShellOutput {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: Some(super::SPAWN_FAILURE_EXIT_CODE),
                timed_out: false,
            };
        }

        let name = container_name();
        let mut cmd = Command::new("docker");
        cmd.args(self.docker_args(&name, image, request))
            .envs(forwarded_env(&request.env));

        debug!(image, container = %name, "running command in container");
        let output = run_process(cmd, "docker", request.timeout, on_output).await;
        if output.timed_out {
            kill_container(&name).await;
        }
        output
    }
}

/// Killing the docker client leaves the container running; stop it by name
async fn kill_container(name: &str) {
    match Command::new("docker").args(["kill", name]).output().await {
        Ok(out) if out.status.success() => info!(container = name, "killed timed-out container"),
        Ok(out) => warn!(
            container = name,
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "could not kill timed-out container"
        ),
        Err(e) => warn!(container = name, error = %e, "could not run docker kill"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_args_mount_workspace_and_hide_values() {
        let runner = ContainerRunner::new();
        let mut env = HashMap::new();
        env.insert("DOCKER_PASS".to_string(), "hunter2".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("CONVEYOR_BRANCH".to_string(), "master".to_string());

        let request = CommandRequest::new("make test", "/src/app").with_env(env);
        let args = runner.docker_args("conveyor-test-0", "rust:1.80", &request);

        assert_eq!(
            &args[..8],
            [
                "run",
                "--rm",
                "--name",
                "conveyor-test-0",
                "-v",
                "/src/app:/workspace",
                "-w",
                "/workspace"
            ]
        );
        assert!(args.contains(&"CONVEYOR_BRANCH".to_string()));
        assert!(args.contains(&"DOCKER_PASS".to_string()));
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert!(!args.contains(&"PATH".to_string()));
        assert_eq!(&args[args.len() - 4..], ["rust:1.80", "sh", "-c", "make test"]);
    }

    #[test]
    fn test_extra_args_precede_image() {
        let runner = ContainerRunner::with_config(ContainerConfig {
            pull_policy: ImagePullPolicy::Never,
            extra_args: vec!["--network".to_string(), "host".to_string()],
        });
        let args = runner.docker_args("c", "alpine", &CommandRequest::new("true", "/w"));
        let image_at = args.iter().position(|a| a == "alpine").unwrap();
        assert_eq!(args[image_at - 1], "host");
    }

    #[tokio::test]
    async fn test_without_image_runs_on_host() {
        let temp = tempfile::tempdir().unwrap();
        let output = ContainerRunner::new()
            .run(&CommandRequest::new("echo host", temp.path()), None)
            .await;
        assert_eq!(output.stdout, "host");
    }

    #[test]
    fn test_container_names_are_unique() {
        let first = container_name();
        let second = container_name();
        assert_ne!(first, second);
        assert!(first.starts_with(&format!("conveyor-{}-", std::process::id())));
    }

    #[tokio::test]
    async fn test_timed_out_container_is_killed_by_name() {
        let runner = ContainerRunner::with_config(ContainerConfig {
            pull_policy: ImagePullPolicy::Never,
            extra_args: Vec::new(),
        });
        if !runner.is_available().await {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let request = CommandRequest::new("sleep 30", temp.path())
            .with_image(Some("alpine".to_string()))
            .with_timeout(Some(std::time::Duration::from_millis(500)));
        let output = runner.run(&request, None).await;
        if !output.timed_out {
            // alpine is not present locally
            return;
        }

        let name = format!("conveyor-{}-", std::process::id());
        let ps = Command::new("docker")
            .args(["ps", "-q", "--filter", &format!("name={}", name)])
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&ps.stdout).trim().is_empty());
    }

    #[test]
    fn test_pull_policy_from_flag_and_yaml() {
        assert_eq!("Always".parse::<ImagePullPolicy>(), Ok(ImagePullPolicy::Always));
        assert_eq!(
            "if-not-present".parse::<ImagePullPolicy>(),
            Ok(ImagePullPolicy::IfNotPresent)
        );
        assert!("sometimes".parse::<ImagePullPolicy>().is_err());

        let parsed: ImagePullPolicy = serde_yaml::from_str("never").unwrap();
        assert_eq!(parsed, ImagePullPolicy::Never);
    }
}
