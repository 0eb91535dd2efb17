// Execution Events
// Progress reporting for pipeline runs

use crate::parser::models::{JobStatus, SkipReason, StepStatus};

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_name: String,
        branch: String,
        total_jobs: usize,
    },

    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    JobStarted {
        job_name: String,
        total_steps: usize,
    },

    JobCompleted {
        job_name: String,
        status: JobStatus,
        exit_code: Option<i32>,
        duration: Duration,
    },

    /// Job never ran (branch filter, unmet prerequisite, aborted run)
    JobSkipped {
        job_name: String,
        reason: SkipReason,
    },

    StepStarted {
        job_name: String,
        step_name: String,
        step_index: usize,
    },

    /// One line of step output (stdout/stderr)
    StepOutput {
        job_name: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    StepCompleted {
        job_name: String,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Gate closed, job aborted, or nothing to do
    StepSkipped {
        job_name: String,
        step_name: String,
        step_index: usize,
        reason: String,
    },

    CacheRestored {
        job_name: String,
        key: String,
        discriminator: String,
    },

    CacheMiss {
        job_name: String,
        key: String,
    },

    CacheSaved {
        job_name: String,
        key: String,
        discriminator: String,
    },

    ArtifactStored {
        job_name: String,
        path: PathBuf,
    },

    /// Outcome of a deploy step; `namespace` is None for a no-op route
    Deployment {
        job_name: String,
        branch: String,
        namespace: Option<String>,
        success: bool,
    },

    Log {
        level: LogLevel,
        message: String,
        job_name: Option<String>,
    },

    Error {
        message: String,
        job_name: Option<String>,
        step_index: Option<usize>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn pipeline_started(
        name: impl Into<String>,
        branch: impl Into<String>,
        total_jobs: usize,
    ) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            branch: branch.into(),
            total_jobs,
        }
    }

    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    pub fn job_started(job_name: impl Into<String>, total_steps: usize) -> Self {
        Self::JobStarted {
            job_name: job_name.into(),
            total_steps,
        }
    }

    pub fn job_completed(
        job_name: impl Into<String>,
        status: JobStatus,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            job_name: job_name.into(),
            status,
            exit_code,
            duration,
        }
    }

    pub fn job_skipped(job_name: impl Into<String>, reason: SkipReason) -> Self {
        Self::JobSkipped {
            job_name: job_name.into(),
            reason,
        }
    }

    pub fn step_started(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
        }
    }

    pub fn step_output(
        job_name: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job_name: job_name.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    pub fn step_skipped(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
            reason: reason.into(),
        }
    }

    pub fn info(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_name,
        }
    }

    pub fn warning(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_name,
        }
    }

    pub fn execution_error(
        message: impl Into<String>,
        job_name: Option<String>,
        step_index: Option<usize>,
    ) -> Self {
        Self::Error {
            message: message.into(),
            job_name,
            step_index,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::pipeline_started("toolkit", "master", 2));
        tx.send_event(ExecutionEvent::job_started("build-image", 3));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::PipelineStarted { total_jobs: 2, .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::JobStarted { .. }));
    }

    #[test]
    fn test_skip_events_keep_reason() {
        let event = ExecutionEvent::job_skipped(
            "publish",
            SkipReason::BranchFiltered {
                branch: "feature-x".to_string(),
            },
        );
        match event {
            ExecutionEvent::JobSkipped { job_name, reason } => {
                assert_eq!(job_name, "publish");
                assert_eq!(reason.to_string(), "branch 'feature-x' excluded by filter");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let event = ExecutionEvent::step_skipped("test", "smoke", 1, "RUN_SMOKETEST is not set");
        assert!(matches!(
            event,
            ExecutionEvent::StepSkipped { step_index: 1, ref reason, .. } if reason.contains("RUN_SMOKETEST")
        ));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::info("no listener", None));
    }
}
