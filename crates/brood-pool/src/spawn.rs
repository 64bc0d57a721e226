//! Launching worker processes.
//!
//! Spawning sits behind a seam: the pool only needs a pipe pair and a
//! process handle. [`CommandLauncher`] is the production implementation
//! over `tokio::process`; [`crate::testing::LoopbackLauncher`] swaps in
//! in-process pipes for tests.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::error::{PoolError, Result};

/// A freshly launched worker's endpoints, from the parent's side.
pub struct WorkerChannel {
    /// Write half (the worker's stdin).
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read half (the worker's stdout).
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    /// Handle for liveness checks and reaping.
    pub process: Box<dyn WorkerProcess>,
}

/// The minimal process surface the pool needs.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// True while the process has not been observed to exit.
    fn is_alive(&mut self) -> bool;

    /// Wait for the process to exit and reap it.
    async fn wait(&mut self) -> std::io::Result<()>;

    /// Begin forceful termination.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Spawns workers for a pool.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerChannel>;
}

/// Launches worker subprocesses from a command line.
///
/// `include` directories are prepended to the child's `PATH`, so a worker
/// binary and its helpers can be picked up from build trees that are not
/// on the parent's own search path.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    args: Vec<OsString>,
    include: Vec<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            include: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append one argument to the worker command line.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Directories prepended to the child's `PATH`.
    pub fn include<I>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.include.extend(dirs);
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn search_path(&self) -> Result<Option<OsString>> {
        if self.include.is_empty() {
            return Ok(None);
        }
        let mut paths = self.include.clone();
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let joined = std::env::join_paths(paths)
            .map_err(|e| PoolError::Config(format!("invalid include path: {e}")))?;
        Ok(Some(joined))
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self) -> Result<WorkerChannel> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(path) = self.search_path()? {
            cmd.env("PATH", path);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::WorkerDied("worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::WorkerDied("worker stdout was not captured".into()))?;
        tracing::debug!(pid = child.id(), program = ?self.program, "spawned worker process");

        Ok(WorkerChannel {
            input: Box::new(stdin),
            output: Box::new(stdout),
            process: Box::new(ChildProcess { child }),
        })
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait(&mut self) -> std::io::Result<()> {
        self.child.wait().await.map(|_| ())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
