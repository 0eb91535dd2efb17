// Shell Runner
// Executes run steps with `sh -c` on the host

use super::{CommandRequest, CommandRunner};

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exit code reported when a step exceeds its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the process could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Output collected during execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Always set once the runner returns; signals map to 128 + n
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn spawn_failed(program: &str, error: std::io::Error) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Failed to spawn '{}': {}", program, error),
            exit_code: Some(SPAWN_FAILURE_EXIT_CODE),
            timed_out: false,
        }
    }
}

/// Callback for handling output lines in real-time; the flag is true for stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Shell runner for executing commands
#[derive(Debug, Clone)]
pub struct ShellRunner {
    program: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            program: "sh".to_string(),
        }
    }

    /// Use another POSIX shell, e.g. `bash`
    pub fn with_shell(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, request: &CommandRequest, on_output: Option<OutputCallback>) -> ShellOutput {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.working_dir)
            .envs(&request.env);

        debug!(shell = %self.program, dir = %request.working_dir.display(), "running command");
        run_process(cmd, &self.program, request.timeout, on_output).await
    }
}

/// Spawn `cmd`, stream both pipes line by line and wait with an optional
/// timeout. Shared by every runner.
pub(crate) async fn run_process(
    mut cmd: Command,
    program: &str,
    timeout: Option<Duration>,
    on_output: Option<OutputCallback>,
) -> ShellOutput {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "failed to spawn");
            return ShellOutput::spawn_failed(program, e);
        }
    };

    let stdout_handle = child
        .stdout
        .take()
        .map(|out| collect_lines(out, false, on_output.clone()));
    let stderr_handle = child
        .stderr
        .take()
        .map(|err| collect_lines(err, true, on_output.clone()));

    let (status, timed_out) = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (status.ok(), false),
            Err(_) => {
                let _ = child.kill().await;
                (None, true)
            }
        },
        None => (child.wait().await.ok(), false),
    };

    // A killed shell may leave grandchildren holding the pipes open
    let drain = if timed_out {
        Some(PIPE_DRAIN_GRACE)
    } else {
        None
    };
    let stdout = join_lines(stdout_handle, drain).await;
    let mut stderr = join_lines(stderr_handle, drain).await;

    let exit_code = if timed_out {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Process timed out after {:?}",
            timeout.unwrap_or_default()
        ));
        TIMEOUT_EXIT_CODE
    } else {
        status.map(exit_code_of).unwrap_or(1)
    };

    ShellOutput {
        stdout,
        stderr,
        exit_code: Some(exit_code),
        timed_out,
    }
}

fn collect_lines<R>(
    reader: R,
    is_stderr: bool,
    on_output: Option<OutputCallback>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut output = String::new();
        // Decode lossily so invalid UTF-8 never stops draining the pipe
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf);
            if let Some(callback) = &on_output {
                callback(&line, is_stderr);
            }
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
        output
    })
}

async fn join_lines(handle: Option<JoinHandle<String>>, limit: Option<Duration>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match limit {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => String::new(),
        },
        None => handle.await.unwrap_or_default(),
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    fn request(command: &str) -> CommandRequest {
        CommandRequest::new(command, std::env::current_dir().unwrap())
    }

    #[tokio::test]
    async fn test_shell_runner_echo() {
        let output = ShellRunner::new().run(&request("echo hello"), None).await;

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.contains("hello"));
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_shell_runner_with_env() {
        let mut env = HashMap::new();
        env.insert("MY_VAR".to_string(), "test_value".to_string());

        let output = ShellRunner::new()
            .run(&request("echo $MY_VAR").with_env(env), None)
            .await;

        assert!(output.success());
        assert!(output.stdout.contains("test_value"));
    }

    #[tokio::test]
    async fn test_shell_runner_exit_code() {
        let output = ShellRunner::new().run(&request("exit 42"), None).await;
        assert_eq!(output.exit_code, Some(42));
    }

    #[tokio::test]
    async fn test_shell_runner_stderr() {
        let output = ShellRunner::new()
            .run(&request("echo error >&2"), None)
            .await;

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stderr.contains("error"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_124() {
        let output = ShellRunner::new()
            .run(
                &request("sleep 5").with_timeout(Some(Duration::from_millis(100))),
                None,
            )
            .await;

        assert!(output.timed_out);
        assert_eq!(output.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stall_the_child() {
        // Enough output after the bad byte to fill the pipe buffer
        let script = "printf 'ok\\n\\377\\n'; i=0; \
                      while [ $i -lt 20000 ]; do echo line; i=$((i+1)); done; echo done";
        let output = ShellRunner::new()
            .run(&request(script).with_timeout(Some(Duration::from_secs(10))), None)
            .await;

        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.starts_with("ok\n\u{FFFD}\n"));
        assert!(output.stdout.ends_with("done"));
    }

    #[tokio::test]
    async fn test_missing_shell_reports_spawn_failure() {
        let output = ShellRunner::with_shell("definitely-not-a-shell-xyz")
            .run(&request("true"), None)
            .await;

        assert_eq!(output.exit_code, Some(SPAWN_FAILURE_EXIT_CODE));
        assert!(output.stderr.contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_streaming_callback_sees_both_pipes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: OutputCallback = Arc::new(move |line: &str, is_stderr: bool| {
            sink.lock().unwrap().push((line.to_string(), is_stderr));
        });

        let output = ShellRunner::new()
            .run(&request("echo out; echo err >&2"), Some(callback))
            .await;

        assert!(output.success());
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&("out".to_string(), false)));
        assert!(seen.contains(&("err".to_string(), true)));
    }
}
