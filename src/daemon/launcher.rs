// Background daemon start-up for CLI commands that need a running daemon

use crate::config::SupervisorSettings;
use crate::error::{ProcwardError, Result};
use crate::ipc::IpcClient;
use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// File in the log directory that receives the daemon's own output
pub const DAEMON_LOG_FILE: &str = "procward-daemon.log";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Start `procward daemon` detached from the calling terminal
///
/// The daemon gets its own process group, no stdin, and its output appended
/// to [`DAEMON_LOG_FILE`] in the log directory. Returns its PID.
pub fn spawn_background(settings: &SupervisorSettings) -> Result<u32> {
    let exe = std::env::current_exe()
        .map_err(|e| ProcwardError::Other(format!("Cannot locate procward binary: {}", e)))?;

    std::fs::create_dir_all(&settings.log_dir)?;
    let log_path = settings.log_dir.join(DAEMON_LOG_FILE);
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let log_err = log.try_clone()?;

    let mut command = Command::new(exe);
    command
        .arg("--socket")
        .arg(&settings.socket_path)
        .arg("daemon")
        .arg("--log-dir")
        .arg(&settings.log_dir)
        .arg("--monitor-interval-ms")
        .arg(settings.monitor_interval.as_millis().to_string())
        .arg("--breach-cooldown-secs")
        .arg(settings.breach_cooldown.as_secs().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .current_dir("/");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command
        .spawn()
        .map_err(|e| ProcwardError::SpawnError(format!("failed to start daemon: {}", e)))?;
    Ok(child.id())
}

/// Make sure a daemon answers on the configured socket, starting one if needed
///
/// Returns `true` when a new daemon was started.
pub fn ensure_running(settings: &SupervisorSettings, timeout: Duration) -> Result<bool> {
    let client = IpcClient::with_socket_path(&settings.socket_path);
    if client.is_daemon_running() {
        return Ok(false);
    }

    let pid = spawn_background(settings)?;
    let started = Instant::now();
    while started.elapsed() < timeout {
        if client.is_daemon_running() {
            return Ok(true);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Err(ProcwardError::TimeoutError(format!(
        "daemon (pid {}) did not come up within {:?}; see {}",
        pid,
        timeout,
        settings.log_dir.join(DAEMON_LOG_FILE).display()
    )))
}
