use std::path::PathBuf;
use std::time::Duration;

/// Default paths for the daemon socket and logs
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/procward.sock";
pub const DEFAULT_LOG_DIR: &str = "/tmp/procward_logs";

/// Runtime settings of the supervisor itself (not of the apps it runs)
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,
    /// Directory for default app log files
    pub log_dir: PathBuf,
    /// How often the resource monitor samples memory
    pub monitor_interval: Duration,
    /// Minimum uptime after a memory restart before another breach counts
    pub breach_cooldown: Duration,
    /// How long log redirection may keep draining after the process exits
    pub log_drain_grace: Duration,
    /// How long `start` waits for each instance to reach Running
    pub start_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            monitor_interval: Duration::from_secs(2),
            breach_cooldown: Duration::from_secs(30),
            log_drain_grace: Duration::from_millis(250),
            start_timeout: Duration::from_secs(10),
        }
    }
}
