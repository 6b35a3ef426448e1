use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, warn};

/// Defines errors that can arise while supervising one campaign process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// An operation that needs a launched process was called before
    /// `start()`. This is a caller bug, not a runtime condition.
    #[error("there is no running process")]
    NotStarted,

    /// The combined stdout/stderr log file could not be opened.
    #[error("failed to open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        source: io::Error,
    },

    /// The shell invocation itself could not be spawned.
    #[error("failed to spawn \"{command}\": {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },
}

/// A non-blocking liveness observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotStarted,
    Running,
    /// The process exited; the code is absent when it was killed by a
    /// signal.
    Exited(Option<i32>),
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "created"),
            ProcessStatus::Running => write!(f, "working"),
            ProcessStatus::Exited(Some(code)) => write!(f, "stopped: {code}"),
            ProcessStatus::Exited(None) => write!(f, "stopped: signal"),
        }
    }
}

/// One supervised operating-system process.
///
/// The command string is launched through the shell, so the pid recorded at
/// start is usually a shell that forked the real fuzzing binary; termination
/// therefore always sweeps the whole descendant tree.
#[derive(Debug)]
pub struct ProcessHandle {
    command: String,
    work_dir: PathBuf,
    log_path: PathBuf,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn new(
        command: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
            log_path: log_path.into(),
            child: None,
        }
    }

    /// The literal command string this handle launches.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Launches the process, redirecting stdout and stderr into the log
    /// file (truncated on each launch).
    ///
    /// Idempotent: a handle that is already started reports the existing
    /// pid instead of double-launching, since a supervisory loop may retry
    /// the call.
    pub fn start(&mut self) -> Result<u32, ProcessError> {
        if let Some(child) = &self.child {
            warn!(pid = child.id(), command = %self.command, "process already exists");
            return Ok(child.id());
        }

        let log = File::create(&self.log_path).map_err(|source| ProcessError::LogFile {
            path: self.log_path.clone(),
            source,
        })?;
        let log_err = log.try_clone().map_err(|source| ProcessError::LogFile {
            path: self.log_path.clone(),
            source,
        })?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.work_dir)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child.id();
        debug!(
            pid,
            cwd = %self.work_dir.display(),
            log = %self.log_path.display(),
            "process started"
        );
        self.child = Some(child);
        Ok(pid)
    }

    /// The recorded pid, or `NotStarted` if the handle was never launched.
    pub fn pid(&self) -> Result<u32, ProcessError> {
        self.child
            .as_ref()
            .map(Child::id)
            .ok_or(ProcessError::NotStarted)
    }

    /// Probes the exit status without waiting.
    pub fn status(&mut self) -> ProcessStatus {
        let Some(child) = &mut self.child else {
            return ProcessStatus::NotStarted;
        };
        match child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited(status.code()),
            Err(err) => {
                // Keep the snapshot total; report the last known state.
                warn!(pid = child.id(), "status probe failed: {err}");
                ProcessStatus::Running
            }
        }
    }

    /// Force-kills the launched process and every process it transitively
    /// spawned, children before parent, then reaps the direct child.
    ///
    /// Best effort: a tree that already exited terminates successfully as a
    /// no-op. Only a handle that was never started is an error.
    pub fn terminate(&mut self) -> Result<(), ProcessError> {
        let Some(child) = &mut self.child else {
            return Err(ProcessError::NotStarted);
        };

        kill_tree(child.id());
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }
}

/// Force-kills every live descendant of `pid`, then `pid` itself.
fn kill_tree(pid: u32) {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let root = Pid::from_u32(pid);
    for victim in descendants(&system, root) {
        if let Some(process) = system.process(victim) {
            debug!(child = victim.as_u32(), parent = pid, "killing descendant");
            process.kill();
        }
    }
    if let Some(process) = system.process(root) {
        process.kill();
    }
}

/// All transitive children of `root` in the given snapshot.
fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) {
                frontier.push(*pid);
                found.push(*pid);
            }
        }
    }
    found
}
