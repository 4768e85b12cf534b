// CLI module - User-facing command-line interface

mod output;

use crate::config::{SupervisorSettings, DEFAULT_LOG_DIR, DEFAULT_SOCKET_PATH};
use crate::daemon::{ensure_running, init_tracing, Daemon};
use crate::error::{ProcwardError, Result};
use crate::ipc::{Command, IpcClient, ResponseData};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// How long the CLI waits for an auto-spawned daemon to answer
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// procward - a small supervisor for PM2-style app declarations
#[derive(Parser, Debug)]
#[command(name = "procward")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Unix socket of the daemon
    #[arg(long, global = true, env = "PROCWARD_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every app declared in a config file
    Start {
        /// Path to the TOML or JSON config file
        config: PathBuf,

        /// Seconds to wait for each instance to reach running
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },

    /// Stop an app or a single instance
    Stop {
        /// App name or instance name
        name: String,
    },

    /// Restart an app or a single instance
    Restart {
        /// App name or instance name
        name: String,
    },

    /// Stop and forget an app or a single instance
    Delete {
        /// App name or instance name
        name: String,
    },

    /// Show the state of managed processes
    Status {
        /// Only show this app or instance
        name: Option<String>,
    },

    /// Print the tail of an app's log files
    Logs {
        /// App name or instance name
        name: String,

        /// Number of lines per stream
        #[arg(short, long, default_value_t = 20)]
        lines: usize,
    },

    /// Run the supervisor in the foreground
    Daemon {
        /// Directory for default log files
        #[arg(long, env = "PROCWARD_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
        log_dir: PathBuf,

        /// Memory sampling interval in milliseconds
        #[arg(long, default_value_t = 2000)]
        monitor_interval_ms: u64,

        /// Uptime required after a memory restart before the next breach counts
        #[arg(long, default_value_t = 30)]
        breach_cooldown_secs: u64,
    },

    /// Stop all processes and shut the daemon down
    Kill,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute()
    }

    /// Execute the parsed command
    fn execute(&self) -> Result<()> {
        if let Commands::Daemon {
            log_dir,
            monitor_interval_ms,
            breach_cooldown_secs,
        } = &self.command
        {
            let settings = SupervisorSettings {
                socket_path: self.socket.clone(),
                log_dir: log_dir.clone(),
                monitor_interval: Duration::from_millis(*monitor_interval_ms),
                breach_cooldown: Duration::from_secs(*breach_cooldown_secs),
                ..SupervisorSettings::default()
            };
            return run_daemon(settings);
        }

        let command = self.build_command()?;
        if matches!(command, Command::Start { .. }) {
            self.ensure_daemon()?;
        }

        let client = IpcClient::with_socket_path(&self.socket);
        let data = match client.request(command) {
            Ok(data) => data,
            Err(ProcwardError::DaemonNotRunning) => {
                output::print_info("procward daemon is not running");
                return Err(ProcwardError::DaemonNotRunning);
            }
            Err(e) => return Err(e),
        };

        output::print_response(&data);

        // A partial start is still a failed command
        if let ResponseData::Started(ref report) = data {
            if !report.is_success() {
                return Err(ProcwardError::Other(format!(
                    "{} of {} app(s) failed to start",
                    report.failures.len(),
                    report.failures.len() + report.started.len()
                )));
            }
        }
        Ok(())
    }

    fn ensure_daemon(&self) -> Result<()> {
        let settings = SupervisorSettings {
            socket_path: self.socket.clone(),
            log_dir: std::env::var_os("PROCWARD_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            ..SupervisorSettings::default()
        };

        let spinner = output::create_spinner("Connecting to procward daemon...");
        let result = ensure_running(&settings, DAEMON_STARTUP_TIMEOUT);
        match &result {
            Ok(true) => spinner.finish_with_message("Started procward daemon"),
            Ok(false) => spinner.finish_and_clear(),
            Err(_) => spinner.abandon_with_message("Could not start procward daemon"),
        }
        result.map(|_| ())
    }

    /// Build an IPC command from the CLI arguments
    fn build_command(&self) -> Result<Command> {
        match &self.command {
            Commands::Start { config, timeout } => {
                // The daemon runs with cwd "/", so relative paths must be resolved here
                let config = std::fs::canonicalize(config).map_err(|e| {
                    ProcwardError::Other(format!(
                        "Cannot read config file {}: {}",
                        config.display(),
                        e
                    ))
                })?;
                Ok(Command::Start {
                    config,
                    timeout: Duration::from_secs(*timeout),
                })
            }
            Commands::Stop { name } => Ok(Command::Stop { name: name.clone() }),
            Commands::Restart { name } => Ok(Command::Restart { name: name.clone() }),
            Commands::Delete { name } => Ok(Command::Delete { name: name.clone() }),
            Commands::Status { name } => Ok(Command::Status { name: name.clone() }),
            Commands::Logs { name, lines } => Ok(Command::Logs {
                name: name.clone(),
                lines: *lines,
            }),
            Commands::Kill => Ok(Command::Shutdown),
            Commands::Daemon { .. } => Err(ProcwardError::Other(
                "daemon runs in-process, not over IPC".to_string(),
            )),
        }
    }
}

fn run_daemon(settings: SupervisorSettings) -> Result<()> {
    init_tracing();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(Daemon::new(settings).run())
}
