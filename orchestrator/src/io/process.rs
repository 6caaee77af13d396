//! Supervised child processes with bounded output.
//!
//! Agents and test commands run as [`Invocation`]s: the caller polls them in
//! short slices so it can heartbeat, observe control flags, and cancel.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured result of a finished invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl InvocationOutput {
    /// Stdout followed by stderr, with truncation notices.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !self.stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

/// Work that is running in the background and can be polled or cancelled.
pub trait Invocation: Send {
    /// Wait up to `timeout`. `Ok(None)` means the work is still running.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<InvocationOutput>>;

    /// Stop the work and return whatever output was captured, if the
    /// streams closed promptly. Calling this after it finished is a no-op.
    fn cancel(&mut self) -> Result<Option<InvocationOutput>>;
}

type ReaderHandle = JoinHandle<Result<(Vec<u8>, usize)>>;

/// How long the output readers may take to close once the child is gone.
const READER_GRACE: Duration = Duration::from_millis(250);

/// A spawned OS process whose pipes are drained on background threads.
pub struct ChildInvocation {
    child: Child,
    stdout: Option<ReaderHandle>,
    stderr: Option<ReaderHandle>,
    finished: bool,
}

impl std::fmt::Debug for ChildInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildInvocation")
            .field("pid", &self.child.id())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Invocation for ChildInvocation {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<InvocationOutput>> {
        if self.finished {
            return Err(anyhow!("invocation already finished"));
        }
        let Some(status) = self
            .child
            .wait_timeout(timeout)
            .context("wait for child")?
        else {
            return Ok(None);
        };
        self.finished = true;

        // Background descendants share the pipes; stop them so the readers
        // see EOF instead of blocking until they exit on their own.
        if let Err(err) = self.kill_group() {
            warn!(err = %err, "failed to stop leftover descendants");
        }
        let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = if self.drain_readers() {
            (
                join_reader(self.stdout.take()).context("join stdout")?,
                join_reader(self.stderr.take()).context("join stderr")?,
            )
        } else {
            warn!("output streams still held open after exit, detaching readers");
            Default::default()
        };
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }
        debug!(exit_code = ?status.code(), "child finished");
        Ok(Some(InvocationOutput {
            exit_code: status.code(),
            success: status.success(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            stderr_truncated,
        }))
    }

    fn cancel(&mut self) -> Result<Option<InvocationOutput>> {
        if self.finished {
            return Ok(None);
        }
        self.finished = true;
        self.kill_group().context("kill child")?;
        let status = self.child.wait().context("wait child after kill")?;
        debug!("child cancelled");

        // Descendants that left the process group may still hold the pipes
        // open; in that case the readers are detached and finish on their own.
        if !self.drain_readers() {
            return Ok(None);
        }
        let (stdout, stdout_truncated) = join_reader(self.stdout.take()).unwrap_or_default();
        let (stderr, stderr_truncated) = join_reader(self.stderr.take()).unwrap_or_default();
        Ok(Some(InvocationOutput {
            exit_code: status.code(),
            success: false,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            stderr_truncated,
        }))
    }
}

impl ChildInvocation {
    /// Kill the child together with everything it spawned into its group.
    #[cfg(unix)]
    fn kill_group(&mut self) -> Result<()> {
        signal_group(self.child.id()).context("signal process group")
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited.
            Err(err) if err.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err).context("kill child"),
        }
    }

    /// Wait up to [`READER_GRACE`] for both readers. On timeout the readers
    /// are detached and `false` is returned.
    fn drain_readers(&mut self) -> bool {
        let deadline = Instant::now() + READER_GRACE;
        while !readers_finished(&self.stdout, &self.stderr) {
            if Instant::now() >= deadline {
                self.stdout.take();
                self.stderr.take();
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

impl Drop for ChildInvocation {
    fn drop(&mut self) {
        if !self.finished
            && let Err(err) = self.cancel()
        {
            warn!(err = %err, "failed to reap child on drop");
        }
    }
}

/// Spawn `cmd` with piped output; `stdin` is written on a helper thread.
#[instrument(skip_all, fields(program = ?cmd.get_program(), output_limit_bytes))]
pub fn spawn_supervised(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    output_limit_bytes: usize,
) -> Result<ChildInvocation> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // The child leads its own group so cancellation reaches its descendants.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input)
                && err.kind() != ErrorKind::BrokenPipe
            {
                warn!(err = %err, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    Ok(ChildInvocation {
        child,
        stdout: Some(thread::spawn(move || {
            read_stream_limited(stdout, output_limit_bytes)
        })),
        stderr: Some(thread::spawn(move || {
            read_stream_limited(stderr, output_limit_bytes)
        })),
        finished: false,
    })
}

/// Run a command to completion. Returns `None` if it was killed after `timeout`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<Option<InvocationOutput>> {
    let mut invocation = spawn_supervised(cmd, stdin.map(<[u8]>::to_vec), output_limit_bytes)?;
    match invocation.wait_timeout(timeout)? {
        Some(output) => Ok(Some(output)),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            invocation.cancel()?;
            Ok(None)
        }
    }
}

/// SIGKILL every process in the group led by `pgid`. An empty group is fine.
#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn readers_finished(stdout: &Option<ReaderHandle>, stderr: &Option<ReaderHandle>) -> bool {
    [stdout, stderr]
        .into_iter()
        .all(|handle| handle.as_ref().is_none_or(JoinHandle::is_finished))
}

fn join_reader(handle: Option<ReaderHandle>) -> Result<(Vec<u8>, usize)> {
    let Some(handle) = handle else {
        return Ok((Vec::new(), 0));
    };
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
