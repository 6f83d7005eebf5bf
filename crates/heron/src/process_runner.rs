// process_runner.rs - External command execution
//
// Spawns an external command, feeds it stdin, and drains stdout/stderr
// concurrently with awaiting process exit so a chatty child can never
// deadlock on a full pipe. A throttled decorator bounds how many external
// processes are live at once.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::perf;
use crate::throttle::Throttle;

/// Outcome of a completed external process.
///
/// Exactly one of `exit_code` and `signal` is set: `exit_code` on normal
/// termination, `signal` when the process was killed by a signal (unix).
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `argv` to completion, writing `stdin` (if any) before closing the
    /// child's input stream.
    ///
    /// Failure to spawn is an error; a process that runs and exits non-zero
    /// or dies on a signal still resolves to a `ProcessResult`.
    pub async fn run(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ProcessResult> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command line"))?;

        perf::increment_process_spawns();
        let start = std::time::Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn {program}: {e}"))?;

        let mut stdin_pipe = child.stdin.take();
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let input = stdin.map(|b| b.to_vec());

        // All three streams and the exit wait progress in parallel; a child
        // that fills stderr before reading stdin cannot wedge us.
        let write_input = async {
            if let (Some(bytes), Some(pipe)) = (input, stdin_pipe.as_mut()) {
                // A child that exits early closes the pipe; that is not an
                // error for the run as a whole.
                if let Err(e) = pipe.write_all(&bytes).await {
                    log::trace!("stdin write to {program} interrupted: {e}");
                }
                if let Err(e) = pipe.shutdown().await {
                    log::trace!("stdin close for {program} interrupted: {e}");
                }
            }
            drop(stdin_pipe);
        };
        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        };

        let (status, stdout, stderr, ()) =
            tokio::join!(child.wait(), read_stdout, read_stderr, write_input);
        let status = status.map_err(|e| anyhow!("failed to wait for {program}: {e}"))?;

        if perf::is_enabled() {
            log::info!("[PERF] process {program} finished in {:?}", start.elapsed());
        }

        Ok(ProcessResult {
            exit_code: status.code(),
            signal: signal_of(&status),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Like [`run`](Self::run), but fail if the process does not complete
    /// within `timeout`. The child is killed on the timeout path via
    /// `kill_on_drop`.
    pub async fn run_with_timeout(
        &self,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ProcessResult> {
        match tokio::time::timeout(timeout, self.run(argv, stdin)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "process {} timed out after {timeout:?}",
                argv.first().map(String::as_str).unwrap_or("<empty>")
            )),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Process runner behind a [`Throttle`]: functionally identical to
/// [`ProcessRunner`], callers are only delayed when the cap is reached.
pub struct ThrottledProcessRunner {
    inner: ProcessRunner,
    throttle: Throttle,
}

impl ThrottledProcessRunner {
    pub fn new(inner: ProcessRunner, max_concurrent: usize) -> Self {
        Self {
            inner,
            throttle: Throttle::new(max_concurrent),
        }
    }

    pub async fn run(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<ProcessResult> {
        self.throttle.run(self.inner.run(argv, stdin)).await
    }

    pub async fn run_with_timeout(
        &self,
        argv: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<ProcessResult> {
        self.throttle
            .run(self.inner.run_with_timeout(argv, stdin, timeout))
            .await
    }

    pub fn active(&self) -> usize {
        self.throttle.active()
    }
}
