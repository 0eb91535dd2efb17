// Deployment module
// Branch routing, manifest rendering and cluster apply

pub mod cluster;
pub mod manifest;
pub mod router;

pub use cluster::{ClusterClient, KubectlClient};
pub use manifest::{render_manifest, RenderedManifest};
pub use router::{DeployAction, DeploymentRouter, DeploymentTarget};

use crate::parser::models::DeployConfig;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("cannot read manifest template {}: {source}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("apply to namespace {namespace} failed: {message}")]
    ApplyFailed { namespace: String, message: String },

    #[error("pipeline has no deploy table")]
    NotConfigured,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a deploy call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Routed to a no-op; nothing was rendered or applied
    Skipped { target: DeploymentTarget },
    Applied {
        target: DeploymentTarget,
        manifest: PathBuf,
        output: String,
    },
}

impl DeployOutcome {
    pub fn target(&self) -> &DeploymentTarget {
        match self {
            DeployOutcome::Skipped { target } | DeployOutcome::Applied { target, .. } => target,
        }
    }
}

/// Route, render and apply for one pipeline's deploy table
#[derive(Clone)]
pub struct Deployer {
    router: DeploymentRouter,
    template: PathBuf,
    placeholder: String,
    out_dir: PathBuf,
    client: Arc<dyn ClusterClient>,
}

impl Deployer {
    /// `template` is resolved against `work_dir`; rendered manifests land in
    /// `<work_dir>/.conveyor/manifests`
    pub fn new(config: &DeployConfig, work_dir: &Path, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            router: DeploymentRouter::new(config),
            template: work_dir.join(&config.template),
            placeholder: config.placeholder.clone(),
            out_dir: work_dir.join(".conveyor").join("manifests"),
            client,
        }
    }

    pub fn router(&self) -> &DeploymentRouter {
        &self.router
    }

    /// Deploy `artifact_id` for `branch`. Apply is attempted exactly once.
    pub async fn deploy(&self, branch: &str, artifact_id: &str) -> Result<DeployOutcome, DeployError> {
        let target = self.router.route(branch);

        let namespace = match &target.action {
            DeployAction::NoOp => {
                info!(branch, "deploy route is a no-op");
                return Ok(DeployOutcome::Skipped { target });
            }
            DeployAction::Apply { namespace, .. } => namespace.clone(),
        };

        let rendered =
            render_manifest(&self.template, &self.placeholder, artifact_id, &self.out_dir).await?;
        let output = self.client.apply(&rendered.path, &namespace).await?;

        info!(branch, namespace = %namespace, artifact = artifact_id, "deployed");
        Ok(DeployOutcome::Applied {
            target,
            manifest: rendered.path,
            output,
        })
    }
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("router", &self.router)
            .field("template", &self.template)
            .field("placeholder", &self.placeholder)
            .finish_non_exhaustive()
    }
}
