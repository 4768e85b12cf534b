// Logs module - Output redirection into log files and tail reading

mod reader;
mod redirector;
mod sink;

pub use reader::{read_last_lines, LogEntry};
pub use redirector::LogRedirector;
pub use sink::LogSink;

use serde::{Deserialize, Serialize};

/// Which child output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "out"),
            LogStream::Stderr => write!(f, "err"),
        }
    }
}
