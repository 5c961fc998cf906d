//! Agent process handle — one `claude` child speaking stream-json over its
//! stdin/stdout.
//!
//! The handle owns the child and all three pipes. `terminate()` closes them
//! exactly once; `kill_on_drop` covers every path that never reaches it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_types::model::Model;
use tether_types::protocol::AgentEvent;

use crate::codec;

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr drain to reach EOF after the child exits.
const STDERR_FLUSH_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("agent executable not found: {0}")]
    ExecutableNotFound(PathBuf),
    #[error("workspace is not a directory: {0}")]
    InvalidWorkspace(PathBuf),
    #[error("failed to spawn agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write to agent: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read from agent: {0}")]
    Read(#[source] std::io::Error),
}

impl ProcessError {
    /// Spawn-time failures, as opposed to a broken pipe on a live process.
    pub fn is_spawn(&self) -> bool {
        matches!(
            self,
            Self::ExecutableNotFound(_) | Self::InvalidWorkspace(_) | Self::Spawn(_)
        )
    }
}

/// What to start the agent with.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub model: Model,
    pub workspace: PathBuf,
    pub budget_cap_usd: f64,
}

/// How the process ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub stderr_tail: Vec<String>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "agent exited with code {code}")?,
            None => write!(f, "agent was killed by a signal")?,
        }
        if let Some(last) = self.stderr_tail.last() {
            write!(f, ": {last}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Agent(AgentEvent),
    /// Output closed and the process is gone. Repeats on every later call.
    Exited(ExitInfo),
}

#[async_trait]
pub trait AgentProcess: Send {
    /// Write one turn to the agent's input.
    async fn send(&mut self, prompt: &str) -> Result<(), ProcessError>;

    /// Wait for the next event. Malformed lines are logged and skipped.
    /// Must be cancel-safe: the runner races it against timers.
    async fn next_event(&mut self) -> Result<ProcessEvent, ProcessError>;

    /// Ask the agent to stop the current turn. Idempotent.
    fn interrupt(&mut self);

    /// Kill the process and release its pipes. Idempotent.
    async fn terminate(&mut self);

    fn is_alive(&mut self) -> bool;

    fn pid(&self) -> Option<u32>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentProcess>, ProcessError>;
}

// ─── Production launcher ──────────────────────────────────────────────────────

/// Starts the agent CLI in stream-json mode.
pub struct ClaudeLauncher {
    executable: PathBuf,
    leading_args: Vec<String>,
}

impl ClaudeLauncher {
    pub fn new(executable: impl Into<PathBuf>, leading_args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            leading_args,
        }
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.leading_args)
            .args([
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
                "--permission-mode",
                "bypassPermissions",
            ])
            .arg("--model")
            .arg(spec.model.as_str())
            .arg("--max-budget-usd")
            .arg(spec.budget_cap_usd.to_string())
            .current_dir(&spec.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessLauncher for ClaudeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn AgentProcess>, ProcessError> {
        if !spec.workspace.is_dir() {
            return Err(ProcessError::InvalidWorkspace(spec.workspace.clone()));
        }

        let child = self.command(spec).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ExecutableNotFound(self.executable.clone())
            } else {
                ProcessError::Spawn(e)
            }
        })?;

        let process = ChildProcess::new(child)?;
        info!(
            "Spawned agent (pid: {:?}, model: {}, workspace: {})",
            process.pid(),
            spec.model,
            spec.workspace.display()
        );
        Ok(Box::new(process))
    }
}

// ─── Child process handle ─────────────────────────────────────────────────────

pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    pending: VecDeque<AgentEvent>,
    exit: Option<ExitInfo>,
    interrupted: bool,
}

impl ChildProcess {
    fn new(mut child: Child) -> Result<Self, ProcessError> {
        let missing = |name: &str| {
            ProcessError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("agent {name} was not captured"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();

        // Drain stderr so a chatty agent never blocks on a full pipe.
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = Arc::clone(&stderr_tail);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!("agent stderr: {}", line.chars().take(200).collect::<String>());
                let mut tail = tail.lock().unwrap();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        Ok(Self {
            child,
            pid,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout).lines()),
            stderr_task: Some(stderr_task),
            stderr_tail,
            pending: VecDeque::new(),
            exit: None,
            interrupted: false,
        })
    }

    /// Wait for the child and record how it ended. Safe to call repeatedly.
    async fn reap(&mut self) -> ExitInfo {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        self.stdin = None;
        self.stdout = None;
        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait for agent process: {}", e);
                None
            }
        };
        if let Some(task) = self.stderr_task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(STDERR_FLUSH_WAIT, task).await.is_err() {
                abort.abort();
            }
        }
        let exit = ExitInfo {
            code,
            stderr_tail: self.stderr_tail.lock().unwrap().iter().cloned().collect(),
        };
        self.exit = Some(exit.clone());
        exit
    }
}

#[async_trait]
impl AgentProcess for ChildProcess {
    async fn send(&mut self, prompt: &str) -> Result<(), ProcessError> {
        let stdin = match (&self.exit, self.stdin.as_mut()) {
            (None, Some(stdin)) => stdin,
            _ => {
                return Err(ProcessError::Write(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "agent process has exited",
                )))
            }
        };
        let frame = codec::encode(prompt);
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(ProcessError::Write)?;
        stdin.flush().await.map_err(ProcessError::Write)?;
        self.interrupted = false;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ProcessEvent, ProcessError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(ProcessEvent::Agent(event));
            }
            let Some(stdout) = self.stdout.as_mut() else {
                return Ok(ProcessEvent::Exited(self.reap().await));
            };
            match stdout.next_line().await {
                Ok(Some(line)) => match codec::decode_line(&line) {
                    Ok(events) => self.pending.extend(events),
                    Err(e) => warn!("Dropping agent output line: {}", e),
                },
                Ok(None) => return Ok(ProcessEvent::Exited(self.reap().await)),
                Err(e) => return Err(ProcessError::Read(e)),
            }
        }
    }

    fn interrupt(&mut self) {
        if self.interrupted || self.exit.is_some() {
            return;
        }
        self.interrupted = true;
        let Some(pid) = self.pid else { return };

        #[cfg(unix)]
        {
            // SAFETY: kill(2) with a pid we spawned and still own.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc != 0 {
                warn!(
                    "Failed to send SIGINT to agent (pid: {}): {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            } else {
                info!("Sent SIGINT to agent (pid: {})", pid);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("No cooperative interrupt on this platform (pid: {}); waiting for grace period", pid);
        }
    }

    async fn terminate(&mut self) {
        if self.exit.is_some() {
            return;
        }
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            debug!("Agent already gone before kill: {}", e);
        }
        let exit = self.reap().await;
        info!("Agent terminated (pid: {:?}, code: {:?})", self.pid, exit.code);
    }

    fn is_alive(&mut self) -> bool {
        self.exit.is_none() && matches!(self.child.try_wait(), Ok(None))
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
