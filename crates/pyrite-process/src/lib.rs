//! Spawning debuggee and helper processes.
//!
//! Two shapes are offered on top of the same spawn path:
//!
//! - [`spawn`] returns a [`ProcessHandle`] with a live stream of stdout/stderr
//!   chunks followed by a single exit notification. The debug adapter uses this
//!   to relay output while it races other work (e.g. connecting to the embedded
//!   debug server) against process exit.
//! - [`exec`] waits for the process and returns the captured output, bounded
//!   per stream.
//!
//! Children are placed in their own process group on Unix so killing a
//! debuggee also takes down anything it spawned.

use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::mpsc,
};
pub use tokio_util::sync::CancellationToken;

/// Forces the interpreter to write stdout/stderr unbuffered.
pub const UNBUFFERED_ENV: &str = "PYTHONUNBUFFERED";
/// Text encoding of the interpreter's standard streams.
pub const IO_ENCODING_ENV: &str = "PYTHONIOENCODING";

const DEFAULT_IO_ENCODING: &str = "utf-8";

/// How long to keep reading pipes after the child exited. A grandchild that
/// inherited the pipes can otherwise keep them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Output chunks buffered ahead of the consumer. A full queue stops the pipe
/// readers, which in turn blocks the child on its next write.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputSource {
    /// DAP `output` event category for this stream.
    pub fn as_category(self) -> &'static str {
        match self {
            OutputSource::Stdout => "stdout",
            OutputSource::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { source: OutputSource, text: String },
    /// Always the last event. `code` is `None` when the process was killed by a
    /// signal.
    Exited { code: Option<i32> },
}

/// Options shared by [`spawn`] and [`exec`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// When cancelled, the process (group) is terminated.
    pub cancellation: Option<CancellationToken>,
    /// Time between the graceful termination signal and the forced kill.
    pub kill_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
            cancellation: None,
            kill_grace: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub spawn: SpawnOptions,
    /// Copy stderr chunks into the captured stdout as well.
    pub merge_stderr: bool,
    /// Treat any stderr output as a failure.
    pub throw_on_stderr: bool,
    /// Maximum bytes captured *per stream*.
    pub max_bytes: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            spawn: SpawnOptions::default(),
            merge_stderr: false,
            throw_on_stderr: false,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// A command invocation, kept for error messages and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: Option<PathBuf>,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(cwd: Option<&Path>, program: &Path, args: &[String]) -> Self {
        Self {
            cwd: cwd.map(Path::to_path_buf),
            program: program.to_path_buf(),
            args: args.to_vec(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable only; not meant to be pasted into a shell.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured stdout/stderr, truncated to a maximum size per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when either stream produced more bytes than were kept.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub output: BoundedOutput,
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: CommandSpec,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` wrote to stderr: {stderr}")]
    Stderr { command: CommandSpec, stderr: String },
}

/// Environment overrides for a child: the caller's overrides plus the
/// unbuffered-output flag, and a UTF-8 stream encoding unless one is already
/// configured (by the caller or inherited).
pub fn child_env_overrides(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = overrides.clone();
    env.insert(UNBUFFERED_ENV.to_string(), "1".to_string());

    // An explicit override wins over the inherited value, even when empty.
    let has_encoding = match env.get(IO_ENCODING_ENV) {
        Some(value) => !value.is_empty(),
        None => std::env::var_os(IO_ENCODING_ENV).is_some_and(|value| !value.is_empty()),
    };
    if !has_encoding {
        env.insert(IO_ENCODING_ENV.to_string(), DEFAULT_IO_ENCODING.to_string());
    }
    env
}

/// Handle to a running child.
///
/// Dropping the handle does not kill the child; call [`ProcessHandle::kill`]
/// for processes whose lifecycle the caller owns.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    command: CommandSpec,
    events: mpsc::Receiver<ProcessEvent>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Next output chunk or the final exit event. Returns `None` after the exit
    /// event has been consumed.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Cancelled once the child has been reaped. The exit event may still be
    /// waiting behind unread output.
    pub fn exited_token(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Terminate the child. Idempotent; a no-op once the child has exited.
    pub fn kill(&self) {
        if !self.exited.is_cancelled() {
            tracing::debug!(target = "pyrite.process", pid = self.pid, "killing process");
        }
        self.kill.cancel();
    }

    /// Wait for the child to exit, discarding any remaining output.
    pub async fn wait(mut self) -> Option<i32> {
        while let Some(event) = self.events.recv().await {
            if let ProcessEvent::Exited { code } = event {
                return code;
            }
        }
        None
    }
}

/// Spawn `program` with piped stdout/stderr.
///
/// Spawn failures (missing executable, permission denied) are returned
/// immediately rather than surfacing as a later exit event.
pub fn spawn(program: &Path, args: &[String], opts: SpawnOptions) -> io::Result<ProcessHandle> {
    let command = CommandSpec::new(opts.cwd.as_deref(), program, args);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(child_env_overrides(&opts.env));
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    // Own process group so termination reaches grandchildren too.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or_default();

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };

    tracing::debug!(target = "pyrite.process", pid, command = %command, "spawned process");

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let kill = CancellationToken::new();
    let exited = CancellationToken::new();

    tokio::spawn(supervise(
        child,
        stdout,
        stderr,
        tx,
        kill.clone(),
        opts.cancellation.unwrap_or_default(),
        exited.clone(),
        opts.kill_grace,
    ));

    Ok(ProcessHandle {
        pid,
        command,
        events: rx,
        kill,
        exited,
    })
}

/// Run `program` to completion and return its captured output.
///
/// A non-zero exit status is not an error; only spawn failures and (when
/// `throw_on_stderr` is set) non-empty stderr are.
pub async fn exec(
    program: &Path,
    args: &[String],
    opts: ExecOptions,
) -> Result<ExecOutput, ProcessError> {
    let command = CommandSpec::new(opts.spawn.cwd.as_deref(), program, args);
    let cancellation = opts.spawn.cancellation.clone();
    let mut handle = spawn(program, args, opts.spawn).map_err(|source| ProcessError::Spawn {
        command: command.clone(),
        source,
    })?;

    let mut stdout = BoundedBuffer::new(opts.max_bytes);
    let mut stderr = BoundedBuffer::new(opts.max_bytes);
    let mut code = None;
    while let Some(event) = handle.next_event().await {
        match event {
            ProcessEvent::Output {
                source: OutputSource::Stdout,
                text,
            } => stdout.push(&text),
            ProcessEvent::Output {
                source: OutputSource::Stderr,
                text,
            } => {
                if opts.merge_stderr {
                    stdout.push(&text);
                }
                stderr.push(&text);
            }
            ProcessEvent::Exited { code: exit_code } => {
                code = exit_code;
                break;
            }
        }
    }

    let output = BoundedOutput {
        truncated: stdout.truncated || stderr.truncated,
        stdout: stdout.text,
        stderr: stderr.text,
    };

    if opts.throw_on_stderr && !output.stderr.is_empty() {
        return Err(ProcessError::Stderr {
            command,
            stderr: output.stderr,
        });
    }

    Ok(ExecOutput {
        code,
        output,
        cancelled: cancellation.is_some_and(|token| token.is_cancelled()),
    })
}

struct BoundedBuffer {
    text: String,
    max_bytes: usize,
    truncated: bool,
}

impl BoundedBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &str) {
        let remaining = self.max_bytes.saturating_sub(self.text.len());
        if chunk.len() <= remaining {
            self.text.push_str(chunk);
            return;
        }

        self.truncated = true;
        let mut end = remaining;
        while end > 0 && !chunk.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&chunk[..end]);
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Kill,
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    tx: mpsc::Sender<ProcessEvent>,
    kill: CancellationToken,
    cancellation: CancellationToken,
    exited: CancellationToken,
    grace: Duration,
) {
    let stdout_task = tokio::spawn(pump(stdout, OutputSource::Stdout, tx.clone()));
    let stderr_task = tokio::spawn(pump(stderr, OutputSource::Stderr, tx.clone()));

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = kill.cancelled() => Outcome::Kill,
        _ = cancellation.cancelled() => Outcome::Kill,
    };
    let status = match outcome {
        Outcome::Exited(status) => status,
        Outcome::Kill => terminate_process_group(&mut child, grace).await,
    };

    for task in [stdout_task, stderr_task] {
        if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await.is_err() {
            tracing::debug!(target = "pyrite.process", "output pipe still open after exit");
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(target = "pyrite.process", error = %err, "failed to reap process");
            None
        }
    };
    tracing::debug!(target = "pyrite.process", ?code, "process exited");

    exited.cancel();
    let _ = tx.send(ProcessEvent::Exited { code }).await;
}

async fn terminate_process_group(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Negative pid targets the group created by `setpgid(0, 0)` in `spawn`.
        let pid = pid as i32;
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        return child.wait().await;
    }

    let _ = grace;
    let _ = child.start_kill();
    child.wait().await
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    source: OutputSource,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let mut buf = vec![0u8; 8 * 1024];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(target = "pyrite.process", ?source, error = %err, "read failed");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8_prefix(&mut pending);
        // A dropped receiver turns this into a plain drain so the child
        // never blocks on a full pipe.
        if !text.is_empty() && !tx.is_closed() {
            let _ = tx.send(ProcessEvent::Output { source, text }).await;
        }
    }

    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(ProcessEvent::Output { source, text }).await;
    }
}

/// Decode as much of `pending` as forms complete UTF-8, leaving a trailing
/// partial code point for the next read.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
