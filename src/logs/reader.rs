use super::LogStream;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Upper bound on the tail buffer reserved up front; `lines` comes from the client
const MAX_PREALLOCATED_LINES: usize = 1024;

/// One line read back from a log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogStream,
    pub line: String,
}

impl LogEntry {
    /// Format the entry for display
    pub fn format(&self) -> String {
        let prefix = match self.stream {
            LogStream::Stdout => "[OUT]",
            LogStream::Stderr => "[ERR]",
        };
        format!("{} {}", prefix, self.line)
    }
}

/// Read the last `lines` lines of a log file
///
/// # Arguments
/// * `file_path` - Path to the log file
/// * `lines` - Number of lines to keep from the end
/// * `stream` - Stream the file belongs to
///
/// # Returns
/// * `Ok(Vec<LogEntry>)` - Entries in file order; empty if the file does not exist
/// * `Err(ProcwardError)` - Failed to read the file
pub async fn read_last_lines(
    file_path: &Path,
    lines: usize,
    stream: LogStream,
) -> Result<Vec<LogEntry>> {
    if lines == 0 || !file_path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(file_path).await?;
    let mut reader = BufReader::new(file);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(lines.min(MAX_PREALLOCATED_LINES));
    let mut buf = Vec::new();

    // Byte-oriented so non-UTF-8 output does not abort the read
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        let line = String::from_utf8_lossy(&buf);
        tail.push_back(line.trim_end_matches(['\n', '\r']).to_string());
    }

    Ok(tail
        .into_iter()
        .map(|line| LogEntry { stream, line })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_last_lines_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let entries = read_last_lines(&temp_dir.path().join("none.log"), 10, LogStream::Stdout)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_read_last_lines_with_content() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("test.log");

        let content: String = (1..=10).map(|i| format!("Line {}\n", i)).collect();
        std::fs::write(&log_file, content).unwrap();

        let entries = read_last_lines(&log_file, 5, LogStream::Stdout).await.unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].line, "Line 6");
        assert_eq!(entries[4].line, "Line 10");
    }

    #[tokio::test]
    async fn test_read_fewer_lines_than_requested() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("short.log");
        std::fs::write(&log_file, "only\nno newline at end").unwrap();

        let entries = read_last_lines(&log_file, 100, LogStream::Stderr).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].line, "no newline at end");
        assert_eq!(entries[1].stream, LogStream::Stderr);
    }

    #[tokio::test]
    async fn test_zero_lines() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("a.log");
        std::fs::write(&log_file, "a\nb\n").unwrap();

        let entries = read_last_lines(&log_file, 0, LogStream::Stdout).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_huge_line_count_reads_whole_file() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("all.log");
        std::fs::write(&log_file, "x\ny\n").unwrap();

        let entries = read_last_lines(&log_file, usize::MAX, LogStream::Stdout)
            .await
            .unwrap();
        let lines: Vec<&str> = entries.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["x", "y"]);
    }

    #[test]
    fn test_log_entry_format() {
        let entry = LogEntry {
            stream: LogStream::Stderr,
            line: "boom".to_string(),
        };
        assert_eq!(entry.format(), "[ERR] boom");
    }
}
