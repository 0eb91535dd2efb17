// Terminal Output
// Renders run progress, load errors and command results

use std::time::Duration;

use conveyor_engine::execution::events::LogLevel;
use conveyor_engine::parser::models::{JobStatus, StepStatus};
use conveyor_engine::{ExecutionEvent, PipelineResult, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Heading,
    Action,
    Good,
    Bad,
    Warn,
    Note,
    Muted,
}

impl Tone {
    fn ansi(self) -> &'static str {
        match self {
            Tone::Heading => "1",
            Tone::Action => "1;36",
            Tone::Good => "32",
            Tone::Bad => "31",
            Tone::Warn => "33",
            Tone::Note => "36",
            Tone::Muted => "2",
        }
    }
}

fn paint(tone: Tone, text: &str) -> String {
    format!("\x1b[{}m{}\x1b[0m", tone.ansi(), text)
}

fn seconds(duration: &Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// Right-aligned verb then message, e.g. `   Validating pipeline.yaml`
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(Tone::Action, &format!("{:>12}", action)), message);
}

pub fn check(message: &str) {
    eprintln!("  {} {}", paint(Tone::Good, "\u{2713}"), message);
}

pub fn failure(message: &str) {
    eprintln!("  {} {}", paint(Tone::Bad, "\u{2717}"), message);
}

pub fn warning(message: &str) {
    eprintln!("  {} {}", paint(Tone::Warn, "!"), message);
}

pub fn info(message: &str) {
    eprintln!("  {} {}", paint(Tone::Note, "i"), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", paint(Tone::Bad, "error:"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(Tone::Muted, message));
}

/// Anything that stopped the run before a job started
pub fn load_error(err: &ServiceError) {
    match err {
        ServiceError::Parse(e) => {
            error(&e.to_string());
            if let Some(suggestion) = &e.suggestion {
                info(&format!("Suggestion: {}", suggestion));
            }
        }
        ServiceError::Graph(e) => error(&format!("Failed to build job graph: {}", e)),
        ServiceError::Config(e) => error(&e.to_string()),
    }
}

/// Failed jobs with their exit codes, in declaration order
pub fn run_failures(result: &PipelineResult) {
    if result.success {
        return;
    }
    eprintln!();
    for job in result.failed_jobs() {
        failure(&format!(
            "{} failed (exit code {})",
            job.job_name,
            job.exit_code.unwrap_or(1)
        ));
    }
}

/// Print one progress event. Step output goes to stdout, everything else
/// to stderr.
pub fn render(event: &ExecutionEvent) {
    if let ExecutionEvent::StepOutput {
        job_name,
        output,
        is_error,
        ..
    } = event
    {
        for line in output.lines() {
            let text = format!("        {} | {}", job_name, line);
            if *is_error {
                eprintln!("{}", paint(Tone::Bad, &text));
            } else {
                println!("{}", text);
            }
        }
        return;
    }

    if matches!(event, ExecutionEvent::PipelineStarted { .. } | ExecutionEvent::PipelineCompleted { .. }) {
        eprintln!();
    }
    let (tone, text) = describe(event);
    eprintln!("{}", paint(tone, &text));
}

fn describe(event: &ExecutionEvent) -> (Tone, String) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            branch,
            total_jobs,
        } => (
            Tone::Heading,
            format!("==> Pipeline '{}' on {} ({} jobs)", pipeline_name, branch, total_jobs),
        ),

        ExecutionEvent::PipelineCompleted {
            success: true,
            duration,
            ..
        } => (
            Tone::Good,
            format!("  \u{2713} Pipeline completed successfully in {}", seconds(duration)),
        ),
        ExecutionEvent::PipelineCompleted { duration, .. } => (
            Tone::Bad,
            format!("  \u{2717} Pipeline failed after {}", seconds(duration)),
        ),

        ExecutionEvent::JobStarted {
            job_name,
            total_steps,
        } => (
            Tone::Heading,
            format!("    Job '{}' ({} steps)", job_name, total_steps),
        ),

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            exit_code,
            duration,
        } => job_completed(job_name, *status, *exit_code, duration),

        ExecutionEvent::JobSkipped { job_name, reason } => {
            (Tone::Warn, format!("    Job '{}' skipped: {}", job_name, reason))
        }

        ExecutionEvent::StepStarted {
            job_name,
            step_name,
            step_index,
        } => (
            Tone::Note,
            format!("      [{}] step {}: {}", job_name, step_index + 1, step_name),
        ),

        ExecutionEvent::StepCompleted {
            job_name,
            status,
            duration,
            exit_code,
            ..
        } => step_completed(job_name, *status, *exit_code, duration),

        ExecutionEvent::StepSkipped {
            job_name,
            step_name,
            reason,
            ..
        } => (
            Tone::Warn,
            format!("        [{}] {} skipped: {}", job_name, step_name, reason),
        ),

        ExecutionEvent::CacheRestored {
            job_name,
            key,
            discriminator,
        } => (
            Tone::Muted,
            format!("        [{}] cache restored {} ({})", job_name, key, discriminator),
        ),
        ExecutionEvent::CacheMiss { job_name, key } => (
            Tone::Muted,
            format!("        [{}] cache miss for {}; building cold", job_name, key),
        ),
        ExecutionEvent::CacheSaved {
            job_name,
            key,
            discriminator,
        } => (
            Tone::Muted,
            format!("        [{}] cache saved {} ({})", job_name, key, discriminator),
        ),

        ExecutionEvent::ArtifactStored { job_name, path } => (
            Tone::Muted,
            format!("        [{}] artifact {}", job_name, path.display()),
        ),

        ExecutionEvent::Deployment {
            job_name,
            branch,
            namespace,
            success,
        } => match (namespace, success) {
            (None, _) => (
                Tone::Note,
                format!("        [{}] {} routes to a no-op deploy", job_name, branch),
            ),
            (Some(ns), true) => (
                Tone::Good,
                format!("        [{}] deployed {} to {}", job_name, branch, ns),
            ),
            (Some(ns), false) => (
                Tone::Bad,
                format!("        [{}] deploying {} to {} failed", job_name, branch, ns),
            ),
        },

        ExecutionEvent::Log {
            level,
            message,
            job_name,
        } => {
            let tone = match level {
                LogLevel::Error => Tone::Bad,
                LogLevel::Warning => Tone::Warn,
                LogLevel::Info => Tone::Note,
                LogLevel::Debug => Tone::Muted,
            };
            (tone, with_job(job_name.as_deref(), message))
        }

        ExecutionEvent::Error {
            message, job_name, ..
        } => (
            Tone::Bad,
            format!("error: {}", with_job(job_name.as_deref(), message)),
        ),

        ExecutionEvent::StepOutput { output, .. } => (Tone::Muted, output.clone()),
    }
}

fn with_job(job_name: Option<&str>, message: &str) -> String {
    match job_name {
        Some(job) => format!("[{}] {}", job, message),
        None => message.to_string(),
    }
}

fn job_completed(
    job_name: &str,
    status: JobStatus,
    exit_code: Option<i32>,
    duration: &Duration,
) -> (Tone, String) {
    match (status, exit_code) {
        (JobStatus::Succeeded, _) => (
            Tone::Good,
            format!("    Job '{}' OK ({})", job_name, seconds(duration)),
        ),
        (JobStatus::Failed, Some(code)) => (
            Tone::Bad,
            format!(
                "    Job '{}' FAIL ({}, exit code {})",
                job_name,
                seconds(duration),
                code
            ),
        ),
        (JobStatus::Failed, None) => (
            Tone::Bad,
            format!("    Job '{}' FAIL ({})", job_name, seconds(duration)),
        ),
        (other, _) => (
            Tone::Muted,
            format!("    Job '{}' {:?} ({})", job_name, other, seconds(duration)),
        ),
    }
}

fn step_completed(
    job_name: &str,
    status: StepStatus,
    exit_code: Option<i32>,
    duration: &Duration,
) -> (Tone, String) {
    let exit = match exit_code {
        Some(code) if code != 0 => format!(", exit code {}", code),
        _ => String::new(),
    };
    match status {
        StepStatus::Succeeded => (
            Tone::Good,
            format!("        [{}] OK ({}{})", job_name, seconds(duration), exit),
        ),
        StepStatus::Failed => (
            Tone::Bad,
            format!("        [{}] FAIL ({}{})", job_name, seconds(duration), exit),
        ),
        StepStatus::Skipped => (Tone::Muted, format!("        [{}] SKIP", job_name)),
    }
}
