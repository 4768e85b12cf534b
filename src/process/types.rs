use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::time::{Duration, SystemTime};

/// Lifecycle status of one supervised instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Restarting => write!(f, "restarting"),
            ProcessStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Runtime state of one supervised instance
///
/// The controller owns the live copy; everything else sees snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Instance name (`app` or `app-<index>`)
    pub name: String,
    pub app: String,
    pub instance: usize,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub restart_count: usize,
    pub last_exit: Option<ExitInfo>,
    pub started_at: Option<SystemTime>,
    pub memory_bytes: Option<u64>,
    /// Why the instance is Failed
    pub failure: Option<String>,
}

impl ProcessHandle {
    pub fn new(app: &str, instance: usize, name: String) -> Self {
        Self {
            name,
            app: app.to_string(),
            instance,
            pid: None,
            status: ProcessStatus::Stopped,
            restart_count: 0,
            last_exit: None,
            started_at: None,
            memory_bytes: None,
            failure: None,
        }
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit.and_then(|e| e.code)
    }

    /// Time since the current run started, if running
    pub fn uptime(&self) -> Option<Duration> {
        match self.status {
            ProcessStatus::Running => self
                .started_at
                .map(|t| SystemTime::now().duration_since(t).unwrap_or_default()),
            _ => None,
        }
    }

    pub(crate) fn mark_running(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.status = ProcessStatus::Running;
        self.started_at = Some(SystemTime::now());
        self.memory_bytes = None;
        self.failure = None;
    }

    pub(crate) fn mark_exited(&mut self, exit: Option<ExitInfo>) {
        self.pid = None;
        self.started_at = None;
        self.memory_bytes = None;
        if exit.is_some() {
            self.last_exit = exit;
        }
    }

    pub(crate) fn mark_failed(&mut self, reason: String) {
        self.pid = None;
        self.status = ProcessStatus::Failed;
        self.failure = Some(reason);
    }
}
