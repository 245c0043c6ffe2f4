//! External command execution with timeouts and cooperative cancellation.
//!
//! The engine never runs a command directly: everything goes through the
//! [`Executor`] seam (so tests can substitute a mock) and scripts go through
//! [`ScriptRunner`], which turns a script body into a shell invocation.
use std::collections::BTreeMap;
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Interval between child-process status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Prefix for environment variables carrying script parameters.
pub const PARAM_ENV_PREFIX: &str = "STATEKEEP_";

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// Whether the process exited with status 0.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
}

impl ExecResult {
    /// Standard output followed by standard error.
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

impl From<Output> for ExecResult {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

/// Errors from launching or supervising an external command.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The program could not be started.
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The command did not finish within its timeout and was killed.
    #[error("'{program}' timed out after {}s", .timeout.as_secs())]
    Timeout {
        /// Program that timed out.
        program: String,
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The run was cancelled while the command was in flight.
    #[error("'{program}' was cancelled")]
    Cancelled {
        /// Program that was terminated.
        program: String,
    },

    /// Waiting on the child process failed.
    #[error("I/O error while running '{program}': {source}")]
    Io {
        /// Program being supervised.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Cooperative cancellation flag shared between the orchestrator, the
/// executor and the CLI's Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A fully described command invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Program to run (looked up on `PATH`).
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Data written to the child's standard input, if any.
    pub stdin: Option<String>,
    /// Working directory, if different from the current one.
    pub current_dir: Option<PathBuf>,
    /// Maximum wall-clock time before the child is killed.
    pub timeout: Duration,
    /// Cancellation flag polled while the child runs.
    pub cancel: Option<CancelToken>,
}

impl CommandRequest {
    /// Build a request for `program` with `args` and the given timeout.
    #[must_use]
    pub fn new(program: impl Into<String>, args: &[&str], timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(ToString::to_string).collect(),
            env: Vec::new(),
            stdin: None,
            current_dir: None,
            timeout,
            cancel: None,
        }
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Feed `input` to the child's standard input.
    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Runs external commands. Injected into the engine so tests can replace it.
#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync {
    /// Run a command to completion (or timeout/cancellation).
    ///
    /// A non-zero exit status is **not** an error; inspect
    /// [`ExecResult::success`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] if the program cannot be started, exceeds its
    /// timeout, or is cancelled.
    fn execute(&self, request: &CommandRequest) -> Result<ExecResult, ExecError>;

    /// Whether `program` can be resolved on `PATH`.
    fn which(&self, program: &str) -> bool;
}

/// Production [`Executor`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, request: &CommandRequest) -> Result<ExecResult, ExecError> {
        let program = request.program.clone();
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &request.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (request.stdin.clone(), child.stdin.take()) {
            // A child that never reads its stdin must not block us.
            thread::spawn(move || {
                pipe.write_all(input.as_bytes()).ok();
            });
        }
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + request.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => return Err(ExecError::Io { program, source }),
            }
            if request.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                child.kill().ok();
                child.wait().ok();
                return Err(ExecError::Cancelled { program });
            }
            if Instant::now() >= deadline {
                child.kill().ok();
                child.wait().ok();
                return Err(ExecError::Timeout {
                    program,
                    timeout: request.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(ExecResult {
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            success: status.success(),
            code: status.code(),
        })
    }

    fn which(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).ok();
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

/// Where a script's code comes from.
#[derive(Debug, Clone, Copy)]
pub enum Script<'a> {
    /// Inline script body.
    Inline(&'a str),
    /// Script file on disk.
    File(&'a Path),
}

/// Runs inline scripts and script files. The engine never embeds a
/// scripting runtime; it only depends on this capability.
pub trait ScriptRunner: Send + Sync {
    /// Run `script` with `params` exported as `STATEKEEP_<NAME>` environment
    /// variables and optional standard input.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] if the interpreter cannot be started, the
    /// script times out, or the run is cancelled.
    fn run_script(
        &self,
        script: Script<'_>,
        params: &BTreeMap<String, String>,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError>;
}

/// [`ScriptRunner`] that executes scripts through the platform shell
/// (`sh` on Unix, Windows `PowerShell` elsewhere).
#[derive(Clone)]
pub struct ShellScriptRunner {
    executor: Arc<dyn Executor>,
    cancel: CancelToken,
}

impl std::fmt::Debug for ShellScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellScriptRunner")
            .field("executor", &"<dyn Executor>")
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl ShellScriptRunner {
    /// Create a runner that delegates to `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, cancel: CancelToken) -> Self {
        Self { executor, cancel }
    }

    fn shell_invocation(script: Script<'_>) -> (&'static str, Vec<String>) {
        if cfg!(windows) {
            let mut args = vec!["-NoProfile".to_string(), "-NonInteractive".to_string()];
            match script {
                Script::Inline(body) => {
                    args.push("-Command".to_string());
                    args.push(body.to_string());
                }
                Script::File(path) => {
                    args.push("-File".to_string());
                    args.push(path.display().to_string());
                }
            }
            ("powershell", args)
        } else {
            match script {
                Script::Inline(body) => ("sh", vec!["-c".to_string(), body.to_string()]),
                Script::File(path) => ("sh", vec![path.display().to_string()]),
            }
        }
    }
}

/// Convert a parameter name into its exported environment variable name.
#[must_use]
pub fn param_env_name(name: &str) -> String {
    let mut out = String::with_capacity(PARAM_ENV_PREFIX.len() + name.len());
    out.push_str(PARAM_ENV_PREFIX);
    out.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    out
}

impl ScriptRunner for ShellScriptRunner {
    fn run_script(
        &self,
        script: Script<'_>,
        params: &BTreeMap<String, String>,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError> {
        let (program, args) = Self::shell_invocation(script);
        let request = CommandRequest {
            program: program.to_string(),
            args,
            env: params
                .iter()
                .map(|(k, v)| (param_env_name(k), v.clone()))
                .collect(),
            stdin: stdin.map(ToString::to_string),
            current_dir: None,
            timeout,
            cancel: Some(self.cancel.clone()),
        };
        self.executor.execute(&request)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_secs(10);

    #[test]
    fn param_env_name_uppercases_and_sanitizes() {
        assert_eq!(param_env_name("value_data"), "STATEKEEP_VALUE_DATA");
        assert_eq!(param_env_name("key-path"), "STATEKEEP_KEY_PATH");
    }

    #[test]
    fn combined_output_appends_stderr() {
        let r = ExecResult {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            success: true,
            code: Some(0),
        };
        assert_eq!(r.combined_output(), "out\nerr\n");
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn shell_runner_forwards_params_as_env() {
        let mut mock = MockExecutor::new();
        mock.expect_execute()
            .withf(|req| {
                req.env
                    .iter()
                    .any(|(k, v)| k == "STATEKEEP_NAME" && v == "Theme")
                    && req.cancel.is_some()
            })
            .times(1)
            .returning(|_| {
                Ok(ExecResult {
                    stdout: "ok".to_string(),
                    stderr: String::new(),
                    success: true,
                    code: Some(0),
                })
            });
        let runner = ShellScriptRunner::new(Arc::new(mock), CancelToken::new());
        let params = BTreeMap::from([("name".to_string(), "Theme".to_string())]);
        let result = runner
            .run_script(Script::Inline("echo ok"), &params, None, SHORT)
            .unwrap();
        assert_eq!(result.stdout, "ok");
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_runs_echo() {
        let result = SystemExecutor
            .execute(&CommandRequest::new("echo", &["hello"], SHORT))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_reports_non_zero_exit() {
        let result = SystemExecutor
            .execute(&CommandRequest::new("false", &[], SHORT))
            .unwrap();
        assert!(!result.success);
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_feeds_stdin() {
        let result = SystemExecutor
            .execute(&CommandRequest::new("cat", &[], SHORT).with_stdin("piped"))
            .unwrap();
        assert_eq!(result.stdout, "piped");
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_times_out() {
        let err = SystemExecutor
            .execute(&CommandRequest::new(
                "sleep",
                &["5"],
                Duration::from_millis(100),
            ))
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }), "got {err}");
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_honours_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let err = SystemExecutor
            .execute(&CommandRequest::new("sleep", &["5"], SHORT).with_cancel(token))
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { .. }));
    }

    #[test]
    fn system_executor_missing_program_is_spawn_error() {
        let err = SystemExecutor
            .execute(&CommandRequest::new(
                "this-program-does-not-exist-12345",
                &[],
                SHORT,
            ))
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn which_missing_program() {
        assert!(!SystemExecutor.which("this-program-does-not-exist-12345"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_runner_runs_inline_script_with_params() {
        let runner = ShellScriptRunner::new(Arc::new(SystemExecutor), CancelToken::new());
        let params = BTreeMap::from([("greeting".to_string(), "hi".to_string())]);
        let result = runner
            .run_script(
                Script::Inline("echo \"$STATEKEEP_GREETING there\""),
                &params,
                None,
                SHORT,
            )
            .unwrap();
        assert_eq!(result.stdout.trim(), "hi there");
    }
}
