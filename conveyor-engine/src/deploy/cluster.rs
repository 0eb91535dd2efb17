// Cluster Client
// Applies rendered manifests to the cluster orchestrator

use super::DeployError;

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

/// Deploy collaborator
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Apply one manifest to a namespace; returns the tool's output
    async fn apply(&self, manifest: &Path, namespace: &str) -> Result<String, DeployError>;
}

/// `kubectl apply -f <manifest> --namespace <ns>`
#[derive(Debug, Clone, Default)]
pub struct KubectlClient {
    binary: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific kube context instead of the current one
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    fn resolve_binary(&self) -> Result<PathBuf, DeployError> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }
        which::which("kubectl").map_err(|_| DeployError::ToolNotFound("kubectl".to_string()))
    }

    pub fn apply_args(&self, manifest: &Path, namespace: &str) -> Vec<String> {
        let mut args = vec![
            "apply".to_string(),
            "-f".to_string(),
            manifest.display().to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubectlClient {
    async fn apply(&self, manifest: &Path, namespace: &str) -> Result<String, DeployError> {
        let binary = self.resolve_binary()?;
        info!(manifest = %manifest.display(), namespace, "applying manifest");

        let output = Command::new(&binary)
            .args(self.apply_args(manifest, namespace))
            .output()
            .await?;

        if !output.status.success() {
            return Err(DeployError::ApplyFailed {
                namespace: namespace.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_args() {
        let client = KubectlClient::new().with_context("ci");
        assert_eq!(
            client.apply_args(Path::new("/w/app.abc.yaml"), "dev"),
            vec!["apply", "-f", "/w/app.abc.yaml", "--namespace", "dev", "--context", "ci"]
        );
    }

    #[tokio::test]
    async fn test_failing_binary_reports_apply_failure() {
        let client = KubectlClient::new().with_binary("false");
        let err = client.apply(Path::new("m.yaml"), "dev").await.unwrap_err();
        assert!(matches!(err, DeployError::ApplyFailed { .. }));
    }
}
