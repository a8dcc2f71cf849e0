//! Subprocess lifecycle: spawn with a prepared environment, wire stdio, tear down
//!
//! A [`Subprocess`] is owned by exactly one request. Teardown runs on every
//! path: [`Subprocess::finish`] waits for the process and then kills whatever
//! is left of its process group, [`Subprocess::abort`] kills straight away,
//! and dropping the handle kills as a last resort.

use crate::config::GatewayConfig;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors starting a subprocess
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot resolve executable {program}: {source}")]
    Resolve {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot open stderr sink: {0}")]
    Stderr(#[source] io::Error),

    #[error("subprocess {0} pipe unavailable")]
    MissingPipe(&'static str),
}

/// Where subprocess stderr goes
#[derive(Debug, Clone, Default)]
pub enum StderrTarget {
    /// Share the gateway's stderr
    #[default]
    Inherit,
    /// Discard
    Null,
    /// Forward each line to the log
    Log,
    /// Append to an open file
    File(Arc<File>),
}

impl StderrTarget {
    /// `inherit`, `null`, `log`, or a file path (created if missing, appended to)
    pub fn parse(value: &str) -> io::Result<Self> {
        match value {
            "" | "inherit" => Ok(StderrTarget::Inherit),
            "null" => Ok(StderrTarget::Null),
            "log" => Ok(StderrTarget::Log),
            path => Self::open_file(path),
        }
    }

    pub fn open_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(StderrTarget::File(Arc::new(file)))
    }

    fn stdio(&self) -> io::Result<Stdio> {
        Ok(match self {
            StderrTarget::Inherit => Stdio::inherit(),
            StderrTarget::Null => Stdio::null(),
            StderrTarget::Log => Stdio::piped(),
            StderrTarget::File(file) => Stdio::from(file.try_clone()?),
        })
    }
}

/// Work out the program path and working directory.
///
/// Without a configured directory the executable's own directory is used.
/// Relative paths are made absolute, since a relative program combined with
/// a different working directory is ambiguous. A bare name is looked up in
/// the working directory first and otherwise left to `PATH` lookup.
pub fn resolve_program(executable: &Path, dir: Option<&Path>) -> io::Result<(PathBuf, PathBuf)> {
    let cwd = match dir {
        Some(dir) => dir.to_path_buf(),
        None => executable
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    if executable.is_absolute() {
        return Ok((executable.to_path_buf(), cwd));
    }

    let bare = executable.components().count() == 1;
    let program = match (bare, dir) {
        (true, _) => {
            let candidate = cwd.join(executable);
            if candidate.is_file() {
                std::path::absolute(candidate)?
            } else {
                executable.to_path_buf()
            }
        }
        (false, Some(dir)) => std::path::absolute(dir.join(executable))?,
        (false, None) => std::path::absolute(executable)?,
    };

    Ok((program, cwd))
}

/// A running subprocess owned by one request
#[derive(Debug)]
pub struct Subprocess {
    child: Child,
    pid: Option<u32>,
    program: String,
    done: bool,
}

impl Subprocess {
    /// Spawn the configured executable with `env` as its complete environment.
    ///
    /// stdin is a pipe when `pipe_stdin` is set and `/dev/null` otherwise.
    pub fn spawn(
        config: &GatewayConfig,
        env: &[String],
        pipe_stdin: bool,
    ) -> Result<Self, SpawnError> {
        let (program, cwd) = resolve_program(&config.executable, config.dir.as_deref())
            .map_err(|source| SpawnError::Resolve {
                program: config.executable.display().to_string(),
                source,
            })?;

        let mut cmd = Command::new(&program);
        cmd.args(&config.args);
        cmd.current_dir(&cwd);
        cmd.env_clear();
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        cmd.stdin(if pipe_stdin { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(config.stderr.stdio().map_err(SpawnError::Stderr)?);
        cmd.kill_on_drop(true);

        // Own process group so teardown reaches anything the executable forks
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Start {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(pid, program = %program.display(), cwd = %cwd.display(), "Subprocess spawned");

        if let (StderrTarget::Log, Some(stderr)) = (&config.stderr, child.stderr.take()) {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        Ok(Self {
            child,
            pid,
            program: program.display().to_string(),
            done: false,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Take the stdin pipe; `None` when stdin was not piped
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, SpawnError> {
        self.child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))
    }

    /// Wait for the subprocess to exit, no later than `deadline`, then kill
    /// anything still running in its process group.
    pub async fn finish(mut self, deadline: Option<Instant>) {
        let exited = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.exited()).await.ok(),
            None => Some(self.exited().await),
        };

        match exited {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!(pid = self.pid, program = %self.program, error = %e, "Error waiting for subprocess"),
            None => warn!(pid = self.pid, program = %self.program, "Subprocess still running at deadline, killing"),
        }

        self.terminate().await;
    }

    /// Kill the subprocess and its process group immediately and reap it.
    pub async fn abort(mut self) {
        debug!(pid = self.pid, program = %self.program, "Killing subprocess");
        self.terminate().await;
    }

    /// Resolve once the leader has exited, leaving it unreaped.
    ///
    /// The zombie keeps the process group id reserved, so the group kill in
    /// `terminate` cannot reach a recycled group.
    #[cfg(unix)]
    async fn exited(&mut self) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || wait_without_reaping(pid))
            .await
            .map_err(io::Error::other)?
    }

    #[cfg(not(unix))]
    async fn exited(&mut self) -> io::Result<()> {
        self.child.wait().await.map(|_| ())
    }

    async fn terminate(&mut self) {
        self.kill_group();
        // Fails harmlessly when the leader has already exited
        let _ = self.child.start_kill();
        match self.child.wait().await {
            Ok(status) => debug!(pid = self.pid, program = %self.program, ?status, "Subprocess reaped"),
            Err(e) => warn!(pid = self.pid, program = %self.program, error = %e, "Error reaping subprocess"),
        }
        self.done = true;
    }

    fn kill_group(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if !self.done {
            self.kill_group();
            // kill_on_drop reaps the child in the background
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(unix)]
fn wait_without_reaping(pid: u32) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Copy a request body into the subprocess stdin, closing it at the end.
pub async fn pump_request_body<B>(mut body: B, mut stdin: ChildStdin) -> io::Result<u64>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut written = 0u64;
    loop {
        // Only the data chunk lives across the write
        let data = match body.frame().await {
            None => break,
            Some(Err(e)) => return Err(io::Error::other(e.to_string())),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) => data,
                Err(_) => continue,
            },
        };
        stdin.write_all(&data).await?;
        written += data.len() as u64;
    }
    stdin.shutdown().await?;
    Ok(written)
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    warn!(target: "cgi", pid, stream = "stderr", "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(pid, error = %e, "Stopped reading subprocess stderr");
                break;
            }
        }
    }
}
