//! Child processes with a wall-clock deadline and bounded output capture.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Everything observed from one finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes read past the limit and discarded.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// A run counts as successful only if it exited zero before the deadline.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr, followed by a marker line for dropped bytes and one for a timeout.
    pub fn stderr_text(&self, label: &str, timeout: Duration) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text += &format!("\n[{label}: {} bytes of stderr dropped]\n", self.stderr_truncated);
        }
        if self.timed_out {
            text += &format!("\n[{label} timed out after {}s]\n", timeout.as_secs());
        }
        text
    }
}

/// Bytes kept from one output stream.
#[derive(Debug, Default)]
struct Capture {
    kept: Vec<u8>,
    dropped: usize,
}

impl Capture {
    /// Read `reader` to EOF, keeping at most `limit` bytes.
    fn drain<R: Read>(mut reader: R, limit: usize) -> Result<Self> {
        let mut capture = Capture::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).context("read child output")?;
            if n == 0 {
                return Ok(capture);
            }
            let keep = n.min(limit.saturating_sub(capture.kept.len()));
            capture.kept.extend_from_slice(&chunk[..keep]);
            capture.dropped += n - keep;
        }
    }
}

/// Run `cmd` to completion or until `timeout`, whichever comes first.
///
/// Both pipes are drained and `stdin` is written on scoped threads while the
/// deadline runs, so neither a chatty child nor one that never reads its input
/// can hold off the timeout. A child that outlives `timeout`
/// is killed and reported with `timed_out = true`. Only a failure to spawn or
/// wait is an `Err`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    debug!(program = ?cmd.get_program(), "spawning child");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout is not a pipe"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr is not a pipe"))?;
    let feed = stdin
        .map(|input| {
            child
                .stdin
                .take()
                .map(|pipe| (input, pipe))
                .ok_or_else(|| anyhow!("child stdin is not a pipe"))
        })
        .transpose()?;

    let (status, timed_out, out, err) =
        thread::scope(|scope| -> Result<(ExitStatus, bool, Capture, Capture)> {
            let out_reader = scope.spawn(|| Capture::drain(stdout, output_limit_bytes));
            let err_reader = scope.spawn(|| Capture::drain(stderr, output_limit_bytes));
            // The pipe drops when the writer returns, closing the child's stdin.
            let writer = feed.map(|(input, mut pipe)| {
                scope.spawn(move || {
                    // Closing stdin early is the child's choice, not a failure.
                    if let Err(e) = pipe.write_all(input) {
                        warn!(err = %e, "child closed stdin early");
                    }
                })
            });

            let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
            if let Some(writer) = writer {
                writer
                    .join()
                    .map_err(|_| anyhow!("stdin writer thread panicked"))?;
            }
            Ok((status, timed_out, joined(out_reader)?, joined(err_reader)?))
        })?;

    if out.dropped > 0 || err.dropped > 0 {
        warn!(
            stdout_dropped = out.dropped,
            stderr_dropped = err.dropped,
            "child output exceeded the limit"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");

    Ok(CommandOutput {
        status,
        stdout: out.kept,
        stderr: err.kept,
        stdout_truncated: out.dropped,
        stderr_truncated: err.dropped,
        timed_out,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "child outlived its deadline, killing");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}

fn joined(reader: ScopedJoinHandle<'_, Result<Capture>>) -> Result<Capture> {
    reader
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}
