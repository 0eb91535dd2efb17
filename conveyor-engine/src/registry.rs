// Image Registry
// Publishes a tagged image when credentials are available

use std::fmt;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("docker is not available: {0}")]
    Unavailable(String),

    #[error("registry login failed for {registry}: {message}")]
    LoginFailed { registry: String, message: String },

    #[error("push of {reference} failed: {message}")]
    PushFailed { reference: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Username/password pair read from the environment
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<< REDACTED >>")
            .finish()
    }
}

/// Registry collaborator. Without credentials the push relies on an
/// existing login.
#[async_trait::async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn push(
        &self,
        image: &str,
        tag: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), RegistryError>;
}

/// `docker login --password-stdin` followed by `docker push`
#[derive(Debug, Clone, Default)]
pub struct DockerRegistry;

impl DockerRegistry {
    pub fn new() -> Self {
        Self
    }

    async fn login(
        &self,
        registry: Option<&str>,
        credentials: &RegistryCredentials,
    ) -> Result<(), RegistryError> {
        let mut cmd = Command::new("docker");
        cmd.args(["login", "--username", &credentials.username, "--password-stdin"]);
        if let Some(registry) = registry {
            cmd.arg(registry);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(credentials.password.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RegistryError::LoginFailed {
                registry: registry.unwrap_or("docker.io").to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(registry = registry.unwrap_or("docker.io"), "logged in");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ImageRegistry for DockerRegistry {
    async fn push(
        &self,
        image: &str,
        tag: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<(), RegistryError> {
        if let Some(credentials) = credentials {
            self.login(registry_host(image), credentials).await?;
        }

        let reference = image_reference(image, tag);
        info!(reference = %reference, "pushing image");
        let output = Command::new("docker")
            .args(["push", &reference])
            .output()
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(RegistryError::PushFailed {
                reference,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

pub fn image_reference(image: &str, tag: &str) -> String {
    format!("{}:{}", image, tag)
}

/// Registry host of an image name, None for Docker Hub
pub fn registry_host(image: &str) -> Option<&str> {
    let (first, _rest) = image.split_once('/')?;
    let looks_like_host = first.contains('.') || first.contains(':') || first == "localhost";
    looks_like_host.then_some(first)
}
