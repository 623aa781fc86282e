//! Command channel: run a shell command locally or on a remote host, stream
//! its output, and await its exit status.
//!
//! Local and remote execution share one abstraction. A [`Session`] binds a
//! [`Shell`] implementation to a [`Target`]; everything above this module
//! (datasets, transfers) only ever talks to a `Session`.

pub mod ssh;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::error::{Error, Result};
pub use ssh::SshConfig;

/// Exit code `ssh` reports when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Upper bound on diagnostic text retained per stream.
const CAPTURE_LIMIT: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(SshConfig),
}

impl Target {
    pub fn host(&self) -> &str {
        match self {
            Target::Local => "localhost",
            Target::Remote(ssh) => &ssh.hostname,
        }
    }
}

/// Transport seam for spawning shell commands.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Start `command` on `target`. The returned process is not awaited.
    async fn spawn(&self, target: &Target, command: &str) -> Result<Process>;
}

/// Runs commands through `sh -c` locally and through `ssh` remotely.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

#[async_trait]
impl Shell for SystemShell {
    async fn spawn(&self, target: &Target, command: &str) -> Result<Process> {
        let mut cmd = match target {
            Target::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Target::Remote(ssh) => ssh.command(command),
        };

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(host = target.host(), %command, "spawn");

        let child = cmd.spawn().map_err(|e| match target {
            Target::Local => Error::Io(e),
            Target::Remote(ssh) => {
                Error::Transport(format!("failed to spawn ssh to {}: {}", ssh.hostname, e))
            }
        })?;
        Process::from_child(child)
    }
}

type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// A running command: two output streams and an exit status that arrives
/// independently of them.
pub struct Process {
    stdout: BoxReader,
    stderr: BoxReader,
    exit: BoxFuture<'static, io::Result<Option<i32>>>,
}

impl Process {
    pub fn new<O, E, F>(stdout: O, stderr: E, exit: F) -> Self
    where
        O: AsyncRead + Send + 'static,
        E: AsyncRead + Send + 'static,
        F: std::future::Future<Output = io::Result<Option<i32>>> + Send + 'static,
    {
        Self {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit: exit.boxed(),
        }
    }

    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to open stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("failed to open stderr".into()))?;
        let exit = async move { child.wait().await.map(|status| status.code()) };
        Ok(Self::new(stdout, stderr, exit))
    }

    /// Drain both streams, then wait for the exit status.
    pub async fn wait_with_output(self) -> Result<CommandOutput> {
        self.stream(|_| {}).await
    }

    /// Forward every chunk from stdout and stderr to `forward` as it arrives,
    /// in arrival order. Completes only once the exit status is observed.
    pub async fn stream<F>(self, mut forward: F) -> Result<CommandOutput>
    where
        F: FnMut(Bytes) + Send,
    {
        let Process {
            mut stdout,
            mut stderr,
            exit,
        } = self;

        let mut out = Capture::default();
        let mut err = Capture::default();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let (mut out_open, mut err_open) = (true, true);

        while out_open || err_open {
            tokio::select! {
                n = stdout.read(&mut out_buf), if out_open => {
                    let n = n?;
                    if n == 0 {
                        out_open = false;
                    } else {
                        out.push(&out_buf[..n]);
                        forward(Bytes::copy_from_slice(&out_buf[..n]));
                    }
                }
                n = stderr.read(&mut err_buf), if err_open => {
                    let n = n?;
                    if n == 0 {
                        err_open = false;
                    } else {
                        err.push(&err_buf[..n]);
                        forward(Bytes::copy_from_slice(&err_buf[..n]));
                    }
                }
            }
        }

        let code = exit.await?;
        Ok(CommandOutput {
            code,
            stdout: out.into_string(),
            stderr: err.into_string(),
        })
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process").finish_non_exhaustive()
    }
}

/// Keeps the tail of a stream, bounded by [`CAPTURE_LIMIT`].
#[derive(Default)]
struct Capture(Vec<u8>);

impl Capture {
    fn push(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
        if self.0.len() > CAPTURE_LIMIT {
            let excess = self.0.len() - CAPTURE_LIMIT;
            self.0.drain(..excess);
        }
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Diagnostic text for error reporting: stderr, or stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let err = self.stderr.trim();
        if !err.is_empty() {
            return err.to_string();
        }
        let out = self.stdout.trim();
        if !out.is_empty() {
            return out.to_string();
        }
        match self.code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A command channel bound to one host.
#[derive(Clone)]
pub struct Session {
    shell: Arc<dyn Shell>,
    target: Target,
    started: DateTime<Utc>,
}

impl Session {
    pub fn local(shell: Arc<dyn Shell>) -> Self {
        Self {
            shell,
            target: Target::Local,
            started: Utc::now(),
        }
    }

    /// Open a session to a remote host, probing it once so authentication
    /// failures surface before any work starts.
    pub async fn open(shell: Arc<dyn Shell>, ssh: SshConfig) -> Result<Self> {
        let session = Self {
            shell,
            target: Target::Remote(ssh),
            started: Utc::now(),
        };
        let check = session.shell.spawn(&session.target, "true").await?;
        let output = check.wait_with_output().await?;
        if !output.success() {
            return Err(Error::Transport(format!(
                "cannot open session to {}: {}",
                session.host(),
                output.diagnostic()
            )));
        }
        tracing::debug!(host = session.host(), "session opened");
        Ok(session)
    }

    pub fn host(&self) -> &str {
        self.target.host()
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.target, Target::Remote(_))
    }

    /// When this session was opened.
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub async fn spawn(&self, command: &str) -> Result<Process> {
        self.shell.spawn(&self.target, command).await
    }

    /// Run a command to completion. A remote connection failure becomes
    /// [`Error::Transport`]; any other exit status is returned to the caller.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        let output = self.spawn(command).await?.wait_with_output().await?;
        if self.is_remote() && output.code == Some(SSH_CONNECTION_FAILURE) {
            return Err(Error::Transport(format!(
                "{}: {}",
                self.host(),
                output.diagnostic()
            )));
        }
        Ok(output)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("started", &self.started)
            .finish()
    }
}

/// Quote a word for `sh` when it contains anything outside a safe set.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
