//! Command runner abstraction and execution results.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};

use crate::error::LifecycleError;

/// Result of running a local helper program such as `ssh` or `scp`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, LifecycleError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    /// `stdin` is written to the process and then closed; without it the
    /// process reads from an empty input.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Spawn`] if the command cannot be started.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

/// Writes `input` and closes the pipe. A child that exits without reading
/// its input is not an error.
async fn feed(pipe: Option<ChildStdin>, input: Option<&[u8]>) -> io::Result<()> {
    let Some((mut pipe, bytes)) = pipe.zip(input) else {
        return Ok(());
    };
    match pipe.write_all(bytes).await {
        Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err),
        _ => Ok(()),
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        stdin: Option<&'a [u8]>,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let spawn_error = |err: io::Error| LifecycleError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            };
            let input = if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            };
            let mut child = Command::new(program)
                .args(args)
                .stdin(input)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(spawn_error)?;
            let pipe = child.stdin.take();
            let (output, ()) = tokio::try_join!(child.wait_with_output(), feed(pipe, stdin))
                .map_err(spawn_error)?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Outcome of a command executed on an instance.
///
/// A non-zero exit status is data, not an error: callers inspect
/// [`ExecutionResult::ok`] or [`ExecutionResult::failed`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionResult {
    /// Standard output with trailing whitespace removed.
    pub stdout: String,
    /// Standard error with trailing whitespace removed.
    pub stderr: String,
    /// Remote exit status; `-1` when the remote side reported none.
    pub return_code: i32,
}

impl ExecutionResult {
    pub(crate) fn from_output(output: CommandOutput) -> Self {
        Self {
            stdout: output.stdout.trim_end().to_owned(),
            stderr: output.stderr.trim_end().to_owned(),
            return_code: output.code.unwrap_or(-1),
        }
    }

    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.return_code == 0
    }

    /// Returns `true` when the command exited with a non-zero status.
    #[must_use]
    pub const fn failed(&self) -> bool {
        !self.ok()
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stdout)
    }
}
