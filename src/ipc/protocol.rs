// IPC Protocol definitions for client-daemon communication

use crate::logs::LogEntry;
use crate::process::{ProcessHandle, StartReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// All available commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Load a config file in the daemon and start its apps
    Start { config: PathBuf, timeout: Duration },
    Stop { name: String },
    Restart { name: String },
    Delete { name: String },
    /// Status of everything, or of one app or instance
    Status { name: Option<String> },
    Logs { name: String, lines: usize },
    Ping,
    /// Stop every app and exit the daemon
    Shutdown,
}

/// Tail of one instance's log files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLogs {
    pub name: String,
    pub entries: Vec<LogEntry>,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Started(StartReport),
    /// Instances affected by stop, restart or delete
    Processes(Vec<ProcessHandle>),
    Status(Vec<ProcessHandle>),
    Logs(Vec<InstanceLogs>),
    Pong { pid: u32 },
    /// Generic success message
    Success(String),
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}
