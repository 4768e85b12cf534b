use super::LogStream;
use crate::config::LogPaths;
use crate::error::{ProcwardError, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Timestamp prefix written before each line when `time` is enabled
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One destination file of a sink
#[derive(Debug)]
struct SinkFile {
    path: PathBuf,
    file: Option<File>,
    /// Set once an error on this file has been reported
    warned: bool,
}

impl SinkFile {
    fn open(path: &Path) -> Self {
        let mut sink = Self {
            path: path.to_path_buf(),
            file: None,
            warned: false,
        };
        match open_append(path) {
            Ok(file) => sink.file = Some(file),
            Err(e) => sink.report(&e),
        }
        sink
    }

    async fn write(&mut self, data: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let result = match file.write_all(data).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let err = ProcwardError::LogWrite(self.path.display().to_string(), e.to_string());
            self.report(&err);
        }
    }

    fn report(&mut self, err: &ProcwardError) {
        if !self.warned {
            warn!("{}", err);
            self.warned = true;
        }
    }
}

fn open_append(path: &Path) -> Result<File> {
    let to_err =
        |e: std::io::Error| ProcwardError::LogWrite(path.display().to_string(), e.to_string());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(to_err)?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_err)?;

    Ok(File::from_std(file))
}

/// Open log files of one process run
///
/// Opening or writing never fails from the caller's point of view: a file that
/// cannot be used is reported once and then skipped, so the child's pipes keep
/// being drained.
#[derive(Debug)]
pub struct LogSink {
    out: SinkFile,
    err: SinkFile,
    combined: Option<SinkFile>,
    time: bool,
}

impl LogSink {
    /// Open (append, create) every file in `paths`
    pub fn open(paths: &LogPaths, time: bool) -> Self {
        let out = SinkFile::open(&paths.out);
        let err = SinkFile::open(&paths.err);
        let combined = paths.combined.as_deref().map(SinkFile::open);

        Self {
            out,
            err,
            combined,
            time,
        }
    }

    /// Append one chunk from `stream`
    ///
    /// Callers pass whole lines (or a trailing partial line at end of stream),
    /// which keeps the combined file interleaved at line granularity.
    pub async fn write(&mut self, stream: LogStream, line: &[u8]) {
        let data = if self.time {
            let mut stamped = format!("{}: ", Local::now().format(TIME_FORMAT)).into_bytes();
            stamped.extend_from_slice(line);
            if !line.ends_with(b"\n") {
                stamped.push(b'\n');
            }
            stamped
        } else {
            line.to_vec()
        };

        match stream {
            LogStream::Stdout => self.out.write(&data).await,
            LogStream::Stderr => self.err.write(&data).await,
        }

        if let Some(ref mut combined) = self.combined {
            combined.write(&data).await;
        }
    }

    /// Whether any configured file failed to open or write
    pub fn has_errors(&self) -> bool {
        self.out.warned
            || self.err.warned
            || self.combined.as_ref().map(|c| c.warned).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &Path, combined: bool) -> LogPaths {
        LogPaths {
            out: dir.join("app-out.log"),
            err: dir.join("app-error.log"),
            combined: combined.then(|| dir.join("app.log")),
        }
    }

    #[tokio::test]
    async fn test_writes_streams_to_their_files() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths(temp_dir.path(), true);
        let mut sink = LogSink::open(&paths, false);

        sink.write(LogStream::Stdout, b"out line\n").await;
        sink.write(LogStream::Stderr, b"err line\n").await;

        assert_eq!(std::fs::read_to_string(&paths.out).unwrap(), "out line\n");
        assert_eq!(std::fs::read_to_string(&paths.err).unwrap(), "err line\n");
        assert_eq!(
            std::fs::read_to_string(paths.combined.unwrap()).unwrap(),
            "out line\nerr line\n"
        );
        assert!(!sink.has_errors());
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths(temp_dir.path(), false);
        std::fs::write(&paths.out, "previous\n").unwrap();

        let mut sink = LogSink::open(&paths, false);
        sink.write(LogStream::Stdout, b"next\n").await;

        assert_eq!(
            std::fs::read_to_string(&paths.out).unwrap(),
            "previous\nnext\n"
        );
    }

    #[tokio::test]
    async fn test_creates_missing_directories() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths(&temp_dir.path().join("nested/logs"), false);

        let mut sink = LogSink::open(&paths, false);
        sink.write(LogStream::Stdout, b"hello\n").await;

        assert_eq!(std::fs::read_to_string(&paths.out).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_timestamp_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let paths = paths(temp_dir.path(), false);

        let mut sink = LogSink::open(&paths, true);
        sink.write(LogStream::Stdout, b"stamped\n").await;
        sink.write(LogStream::Stdout, b"partial").await;

        let content = std::fs::read_to_string(&paths.out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": stamped"));
        assert!(lines[1].ends_with(": partial"));
        // 2024-01-01T00:00:00
        assert_eq!(lines[0].find(": "), Some(19));
    }

    #[tokio::test]
    async fn test_unwritable_path_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a dir").unwrap();

        let paths = LogPaths {
            out: blocker.join("out.log"),
            err: temp_dir.path().join("err.log"),
            combined: None,
        };

        let mut sink = LogSink::open(&paths, false);
        sink.write(LogStream::Stdout, b"lost\n").await;
        sink.write(LogStream::Stderr, b"kept\n").await;

        assert!(sink.has_errors());
        assert_eq!(std::fs::read_to_string(&paths.err).unwrap(), "kept\n");
    }
}
