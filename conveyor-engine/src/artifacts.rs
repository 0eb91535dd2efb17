// Artifact Storage
// Best-effort copy-out of files produced by steps

use crate::execution::scheduler::PipelineResult;

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

const SUMMARY_FILE: &str = "summary.json";

/// Destination for step artifacts
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Copy `source` (file or directory) out for `job`.
    /// Returns `Ok(None)` when the source does not exist.
    async fn store(&self, job: &str, source: &Path) -> io::Result<Option<PathBuf>>;
}

/// Copies artifacts into `<root>/<run id>/<job>/`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    run_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl AsRef<Path>, run_id: &str) -> Self {
        Self {
            run_dir: root.as_ref().join(run_id),
        }
    }

    /// `~/.conveyor/artifacts`
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conveyor")
            .join("artifacts")
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Write `summary.json` next to the run's artifacts
    pub async fn write_summary(&self, summary: &RunSummary) -> io::Result<PathBuf> {
        let body = serde_json::to_vec_pretty(summary).map_err(io::Error::other)?;
        tokio::fs::create_dir_all(&self.run_dir).await?;
        let path = self.run_dir.join(SUMMARY_FILE);
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Machine-readable record of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub branch: String,
    pub revision: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: u128,
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    pub duration_ms: u128,
}

impl RunSummary {
    pub fn new(result: &PipelineResult, branch: &str, revision: &str) -> Self {
        Self {
            pipeline: result.pipeline_name.clone(),
            branch: branch.to_string(),
            revision: revision.to_string(),
            success: result.success,
            exit_code: result.exit_code(),
            duration_ms: result.duration.as_millis(),
            jobs: result
                .jobs
                .iter()
                .map(|job| JobSummary {
                    name: job.job_name.clone(),
                    status: job.status.to_string(),
                    exit_code: job.exit_code,
                    skip_reason: job.skip_reason.as_ref().map(|r| r.to_string()),
                    artifacts: job.artifacts.clone(),
                    duration_ms: job.duration.as_millis(),
                })
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, job: &str, source: &Path) -> io::Result<Option<PathBuf>> {
        let source = source.to_path_buf();
        let job_dir = self.run_dir.join(job_dir_name(job));

        tokio::task::spawn_blocking(move || copy_out(&source, &job_dir))
            .await
            .map_err(io::Error::other)?
    }
}

fn copy_out(source: &Path, job_dir: &Path) -> io::Result<Option<PathBuf>> {
    if !source.exists() {
        return Ok(None);
    }
    let Some(name) = source.file_name() else {
        return Ok(None);
    };

    std::fs::create_dir_all(job_dir)?;
    let dest = job_dir.join(name);
    if source.is_dir() {
        copy_dir(source, &dest)?;
    } else {
        std::fs::copy(source, &dest)?;
    }
    Ok(Some(dest))
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Identifier for one pipeline run, sortable by start time. Millisecond
/// stamp plus process id keeps concurrent runs of one revision apart.
pub fn run_id(revision: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let revision: String = revision
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    let id = format!("{}-{}", stamp, std::process::id());
    if revision.is_empty() {
        id
    } else {
        format!("{}-{}", id, revision)
    }
}

/// Job names are free text; keep each one a single directory under the run
fn job_dir_name(job: &str) -> String {
    let name: String = job
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("_{}", name),
        _ => name,
    }
}
