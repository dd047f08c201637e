//! Bounded execution of host tools (`cryptsetup`, `blkid`, `mkfs.*`, ...).
//!
//! Tools run synchronously on the calling thread with a wall-clock limit.
//! Secret material is only ever passed on stdin, never in argv.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::CsiError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured result of a finished tool.
#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `-1` when killed by a signal.
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Most useful text for an error message: stderr, else stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let text = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        if text.is_empty() {
            format!("exit code {}", self.status)
        } else {
            format!("{text} (exit code {})", self.status)
        }
    }
}

/// Runs host tools with a timeout.
#[derive(Debug, Clone)]
pub(crate) struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `program args...`, feeding `input` on stdin when given.
    pub fn run(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<Output, CsiError> {
        debug!(program, ?args, "running host tool");
        let mut command = Command::new(program);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command
            .spawn()
            .map_err(|e| CsiError::Internal(format!("failed to execute {program}: {e}")))?;

        if let Some(payload) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            if let Err(e) = stdin.write_all(payload) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CsiError::Internal(format!(
                    "failed to write stdin of {program}: {e}"
                )));
            }
            // Dropping stdin closes the pipe so the tool sees EOF.
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(program, child, stdout_pipe, stderr_pipe)
    }

    /// Like [`Self::run`] but turns a non-zero exit into an error built by
    /// `on_failure` from the tool's diagnostic.
    pub fn run_checked(
        &self,
        program: &str,
        args: &[&str],
        input: Option<&[u8]>,
        on_failure: impl FnOnce(String) -> CsiError,
    ) -> Result<Output, CsiError> {
        let out = self.run(program, args, input)?;
        if out.success() {
            Ok(out)
        } else {
            Err(on_failure(format!("{program}: {}", out.diagnostic())))
        }
    }

    fn wait_with_timeout(
        &self,
        program: &str,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> Result<Output, CsiError> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait().map_err(CsiError::internal)? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CsiError::Internal(format!(
                "{program} timed out after {:?}",
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| CsiError::internal("stdout reader thread panicked"))?;
        let stderr = stderr_handle
            .join()
            .map_err(|_| CsiError::internal("stderr reader thread panicked"))?;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            // A read error leaves whatever was collected so far.
            let _ = reader.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}
