// Daemon module - Long-running supervisor process serving the CLI over IPC

mod launcher;

pub use launcher::{ensure_running, spawn_background, DAEMON_LOG_FILE};

use crate::config::SupervisorSettings;
use crate::error::Result;
use crate::ipc::{Command, IpcServer, InstanceLogs, ResponseData};
use crate::logs::{read_last_lines, LogStream};
use crate::process::Supervisor;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` filter
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

/// The supervisor together with its IPC endpoint
pub struct Daemon {
    supervisor: Arc<Supervisor>,
    ipc_server: IpcServer,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self::with_supervisor(Arc::new(Supervisor::new(settings)))
    }

    pub fn with_supervisor(supervisor: Arc<Supervisor>) -> Self {
        let ipc_server = IpcServer::with_socket_path(&supervisor.settings().socket_path);
        Self {
            supervisor,
            ipc_server,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Cancelling this token shuts the daemon down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve requests until SIGTERM, SIGINT or a `Shutdown` command, then stop
    /// every supervised process
    pub async fn run(mut self) -> Result<()> {
        self.ipc_server.start()?;
        info!(
            "procward daemon (pid {}) listening on {}",
            std::process::id(),
            self.ipc_server.socket_path().display()
        );

        let signals = tokio::spawn(wait_for_signal(self.shutdown.clone()));

        let supervisor = Arc::clone(&self.supervisor);
        let shutdown = self.shutdown.clone();
        let served = self
            .ipc_server
            .run(
                move |command| {
                    let supervisor = Arc::clone(&supervisor);
                    let shutdown = shutdown.clone();
                    async move { handle_command(command, supervisor, shutdown).await }
                },
                self.shutdown.clone(),
            )
            .await;

        if let Err(ref e) = served {
            error!("IPC server error: {}", e);
        }

        info!("Shutting down daemon");
        self.supervisor.shutdown().await;
        signals.abort();
        self.ipc_server.stop()?;
        info!("Daemon stopped");
        served
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

/// Handle a command from a client
async fn handle_command(
    command: Command,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> Result<ResponseData> {
    match command {
        Command::Start { config, timeout } => {
            let report = supervisor.start_config(&config, timeout).await?;
            Ok(ResponseData::Started(report))
        }
        Command::Stop { name } => Ok(ResponseData::Processes(supervisor.stop(&name).await?)),
        Command::Restart { name } => Ok(ResponseData::Processes(supervisor.restart(&name).await?)),
        Command::Delete { name } => Ok(ResponseData::Processes(supervisor.delete(&name).await?)),
        Command::Status { name } => Ok(ResponseData::Status(
            supervisor.status(name.as_deref()).await?,
        )),
        Command::Logs { name, lines } => {
            let mut logs = Vec::new();
            for (instance, paths) in supervisor.log_paths(&name).await? {
                let mut entries = read_last_lines(&paths.out, lines, LogStream::Stdout).await?;
                entries.extend(read_last_lines(&paths.err, lines, LogStream::Stderr).await?);
                logs.push(InstanceLogs {
                    name: instance,
                    entries,
                });
            }
            Ok(ResponseData::Logs(logs))
        }
        Command::Ping => Ok(ResponseData::Pong {
            pid: std::process::id(),
        }),
        Command::Shutdown => {
            supervisor.shutdown().await;
            shutdown.cancel();
            Ok(ResponseData::Success("Daemon stopped".to_string()))
        }
    }
}
